use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Build a new ISO 9660 image from a set of files and directories.
  Create {
    /// Path of the image to write.
    #[arg(short, long)]
    output: PathBuf,

    /// Volume identifier (up to 32 characters).
    #[arg(long, default_value = "ISOPOD")]
    volume_id: String,

    #[arg(long, default_value = "")]
    publisher: String,

    #[arg(long, default_value = "")]
    preparer: String,

    /// Files and directories to add at the root of the image.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Write a parallel Joliet tree alongside the ISO 9660 tree.
    #[arg(long)]
    joliet: bool,

    /// Write POSIX metadata, long names, and symlinks via Rock Ridge.
    #[arg(long)]
    rock_ridge: bool,
  },

  /// Extract every file in an image to a directory on disk.
  Extract {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,
  },

  /// List the contents of an image.
  List {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    verbose: bool,
  },

  /// Print volume descriptor metadata for an image.
  Info {
    #[arg(short, long)]
    input: PathBuf,
  },

  /// Check that an image's volume descriptors and directory tree parse.
  Validate {
    #[arg(short, long)]
    input: PathBuf,
  },
}
