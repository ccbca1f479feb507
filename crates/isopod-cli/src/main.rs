use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

mod cli;

fn add_tree(iso: &mut isopod::Iso<File>, host_root: &Path, image_root: &str) -> Result<()> {
  if host_root.is_file() {
    let data = fs::read(host_root).with_context(|| format!("reading `{}`", host_root.display()))?;
    return iso
      .add_file(image_root, data)
      .with_context(|| format!("adding file `{image_root}`"));
  }

  // `WalkDir` yields a directory before any of its descendants, so adding
  // entries in iteration order always sees the parent already in the tree.
  let walker = walkdir::WalkDir::new(host_root).sort_by_file_name();
  for entry in walker {
    let entry = entry.with_context(|| format!("walking `{}`", host_root.display()))?;
    let relative = entry.path().strip_prefix(host_root).unwrap();
    let image_path = if relative.as_os_str().is_empty() {
      image_root.to_string()
    } else {
      format!("{image_root}/{}", relative.to_string_lossy())
    };

    if entry.file_type().is_dir() {
      iso
        .add_directory(&image_path)
        .with_context(|| format!("adding directory `{image_path}`"))?;
    } else {
      let data = fs::read(entry.path()).with_context(|| format!("reading `{}`", entry.path().display()))?;
      iso
        .add_file(&image_path, data)
        .with_context(|| format!("adding file `{image_path}`"))?;
    }
  }
  Ok(())
}

fn create(
  output: PathBuf,
  volume_id: String,
  publisher: String,
  preparer: String,
  files: Vec<PathBuf>,
  joliet: bool,
  rock_ridge: bool,
) -> Result<()> {
  let mut extensions = isopod::Extensions::empty();
  if joliet {
    extensions |= isopod::Extensions::JOLIET;
  }
  if rock_ridge {
    extensions |= isopod::Extensions::ROCK_RIDGE;
  }

  let mut iso: isopod::Iso<File> = isopod::Iso::create(extensions);
  iso.metadata.volume_identifier = volume_id;
  iso.metadata.publisher_identifier = publisher;
  iso.metadata.data_preparer_identifier = preparer;

  for path in &files {
    let name = path
      .file_name()
      .ok_or_else(|| anyhow::anyhow!("`{}` has no file name", path.display()))?
      .to_string_lossy()
      .into_owned();
    add_tree(&mut iso, path, &name)?;
  }

  let mut out = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(true)
    .open(&output)
    .with_context(|| format!("creating `{}`", output.display()))?;

  let bar = ProgressBar::new(100);
  bar.set_style(
    ProgressStyle::with_template("{bar:40} {percent}%")
      .unwrap_or_else(|_| ProgressStyle::default_bar()),
  );
  iso
    .write(
      &mut out,
      Some(&mut |done, total| {
        if total > 0 {
          bar.set_position((done * 100) / total);
        }
      }),
    )
    .context("writing image")?;
  bar.finish_and_clear();

  println!("wrote {}", output.display());
  Ok(())
}

fn extract_dir(iso: &mut isopod::Iso<File>, image_path: &str, host_path: &Path) -> Result<()> {
  fs::create_dir_all(host_path).with_context(|| format!("creating `{}`", host_path.display()))?;
  for name in iso.list_dir(image_path)? {
    let child_image_path = if image_path.is_empty() {
      name.clone()
    } else {
      format!("{image_path}/{name}")
    };
    let child_host_path = host_path.join(&name);
    let info = iso.get_entry(&child_image_path)?;
    match info.kind {
      isopod::EntryKind::Directory => extract_dir(iso, &child_image_path, &child_host_path)?,
      isopod::EntryKind::File => {
        let data = iso.read_file(&child_image_path)?;
        fs::write(&child_host_path, data)
          .with_context(|| format!("writing `{}`", child_host_path.display()))?;
      }
      isopod::EntryKind::Symlink => {
        let target = iso.read_file(&child_image_path)?;
        let target = String::from_utf8_lossy(&target).into_owned();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &child_host_path)
          .with_context(|| format!("linking `{}`", child_host_path.display()))?;
        #[cfg(not(unix))]
        fs::write(&child_host_path, target.as_bytes())?;
      }
    }
  }
  Ok(())
}

fn extract(input: PathBuf, output: PathBuf) -> Result<()> {
  let file = File::open(&input).with_context(|| format!("opening `{}`", input.display()))?;
  let mut iso = isopod::Iso::open(file, isopod::Extensions::all())
    .with_context(|| format!("reading `{}`", input.display()))?;
  extract_dir(&mut iso, "", &output)?;
  println!("extracted to {}", output.display());
  Ok(())
}

fn list_dir(iso: &isopod::Iso<File>, image_path: &str, depth: usize, verbose: bool) -> Result<()> {
  let mut names = iso.list_dir(image_path)?;
  names.sort();
  for name in names {
    let child_image_path = if image_path.is_empty() {
      name.clone()
    } else {
      format!("{image_path}/{name}")
    };
    let info = iso.get_entry(&child_image_path)?;
    let indent = "  ".repeat(depth);
    match info.kind {
      isopod::EntryKind::Directory => {
        println!("{indent}{name}/");
        list_dir(iso, &child_image_path, depth + 1, verbose)?;
      }
      isopod::EntryKind::File => {
        if verbose {
          let stamp = info.recording_time.datetime.format("%Y-%m-%d %H:%M:%S");
          println!("{indent}{name}  {} bytes  {stamp}", info.size);
        } else {
          println!("{indent}{name}");
        }
      }
      isopod::EntryKind::Symlink => println!("{indent}{name} -> (symlink)"),
    }
  }
  Ok(())
}

fn list(input: PathBuf, verbose: bool) -> Result<()> {
  let file = File::open(&input).with_context(|| format!("opening `{}`", input.display()))?;
  let iso = isopod::Iso::open(file, isopod::Extensions::all())
    .with_context(|| format!("reading `{}`", input.display()))?;
  list_dir(&iso, "", 0, verbose)
}

fn info(input: PathBuf) -> Result<()> {
  let file = File::open(&input).with_context(|| format!("opening `{}`", input.display()))?;
  let iso = isopod::Iso::open(file, isopod::Extensions::all())
    .with_context(|| format!("reading `{}`", input.display()))?;
  println!("volume identifier:   {}", iso.metadata.volume_identifier);
  println!("system identifier:   {}", iso.metadata.system_identifier);
  println!("publisher:           {}", iso.metadata.publisher_identifier);
  println!("data preparer:       {}", iso.metadata.data_preparer_identifier);
  println!("application:         {}", iso.metadata.application_identifier);
  Ok(())
}

fn validate(input: PathBuf) -> Result<()> {
  let file = File::open(&input).with_context(|| format!("opening `{}`", input.display()))?;
  isopod::Iso::open(file, isopod::Extensions::all())
    .with_context(|| format!("`{}` failed to parse", input.display()))?;
  println!("{} is a valid ISO 9660 image", input.display());
  Ok(())
}

fn main() -> Result<()> {
  env_logger::init();
  let cli = cli::Cli::parse();

  match cli.command {
    cli::Command::Create {
      output,
      volume_id,
      publisher,
      preparer,
      files,
      joliet,
      rock_ridge,
    } => create(output, volume_id, publisher, preparer, files, joliet, rock_ridge),
    cli::Command::Extract { input, output } => extract(input, output),
    cli::Command::List { input, verbose } => list(input, verbose),
    cli::Command::Info { input } => info(input),
    cli::Command::Validate { input } => validate(input),
  }
}
