use std::io::Cursor;

use isopod::{BootConfig, Emulation, EntryKind, Extensions, Iso, PlatformId};

fn write_to_vec(iso: &mut Iso<Cursor<Vec<u8>>>) -> (Vec<u8>, u64, u64, u32) {
    let mut first_done = None;
    let mut last = (0u64, 0u64);
    let mut call_count = 0u32;
    let mut cursor = Cursor::new(Vec::new());
    iso.write(
        &mut cursor,
        Some(&mut |done, total| {
            if first_done.is_none() {
                first_done = Some(done);
            }
            last = (done, total);
            call_count += 1;
        }),
    )
    .expect("writing the image should succeed");
    (cursor.into_inner(), first_done.unwrap(), last.1, call_count)
}

#[test]
fn empty_image_has_only_the_root_directory() {
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
    let (bytes, _, _, _) = write_to_vec(&mut iso);

    let opened = Iso::open(Cursor::new(bytes), Extensions::empty()).unwrap();
    assert!(opened.list_dir("").unwrap().is_empty());
}

#[test]
fn single_file_roundtrips_with_its_content_and_size() {
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
    iso.add_file("foo", b"foo\n".to_vec()).unwrap();
    let (bytes, _, _, _) = write_to_vec(&mut iso);

    let mut opened = Iso::open(Cursor::new(bytes), Extensions::empty()).unwrap();
    let names = opened.list_dir("").unwrap();
    assert_eq!(names.len(), 1);

    let entry = opened.get_entry(&names[0]).unwrap();
    assert_eq!(entry.kind, EntryKind::File);
    assert_eq!(entry.size, 4);

    let contents = opened.read_file(&names[0]).unwrap();
    assert_eq!(contents, b"foo\n");
}

#[test]
fn rock_ridge_preserves_real_names_past_the_level_1_depth_limit() {
    let extensions = Extensions::ROCK_RIDGE;
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(extensions);

    let mut path = String::new();
    for i in 1..=9 {
        path = if path.is_empty() {
            format!("dir{i}")
        } else {
            format!("{path}/dir{i}")
        };
        iso.add_directory(&path).unwrap();
    }
    iso.add_file(&format!("{path}/foo"), b"deep".to_vec()).unwrap();

    let (bytes, _, _, _) = write_to_vec(&mut iso);
    let mut opened = Iso::open(Cursor::new(bytes), extensions).unwrap();

    let full_path = (1..=9)
        .map(|i| format!("dir{i}"))
        .collect::<Vec<_>>()
        .join("/");
    let contents = opened.read_file(&format!("{full_path}/foo")).unwrap();
    assert_eq!(contents, b"deep");
}

#[test]
fn el_torito_boot_info_table_checksum_survives_a_roundtrip() {
    let extensions = Extensions::EL_TORITO;
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(extensions);

    let boot_image: Vec<u8> = (0u8..128).collect();
    let expected_checksum = boot_image[64..]
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc.wrapping_add(u32::from_le_bytes(w.try_into().unwrap())));
    iso.add_file("boot.img", boot_image.clone()).unwrap();
    iso.set_boot_config(BootConfig {
        boot_file_path: "boot.img".to_string(),
        platform_id: PlatformId::X86,
        emulation: Emulation::NoEmulation,
        patch_boot_info_table: true,
    })
    .unwrap();

    let (bytes, _, _, _) = write_to_vec(&mut iso);
    let mut opened = Iso::open(Cursor::new(bytes), extensions).unwrap();
    let names = opened.list_dir("").unwrap();
    assert_eq!(names.len(), 1);
    let patched = opened.read_file(&names[0]).unwrap();

    assert_eq!(patched.len(), boot_image.len());
    assert_eq!(u32::from_le_bytes(patched[0..4].try_into().unwrap()), 16);
    let checksum = u32::from_le_bytes(patched[12..16].try_into().unwrap());
    assert_eq!(checksum, expected_checksum);
    // Bytes past the boot info table are untouched by the patch.
    assert_eq!(&patched[64..], &boot_image[64..]);
}

#[test]
fn combined_joliet_rock_ridge_el_torito_xa_image_roundtrips() {
    let extensions = Extensions::JOLIET | Extensions::ROCK_RIDGE | Extensions::EL_TORITO | Extensions::XA;
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(extensions);

    iso.add_directory("programs").unwrap();
    iso.add_file(
        "programs/a long mixed Case name.txt",
        b"payload".to_vec(),
    )
    .unwrap();

    let boot_image: Vec<u8> = (0u8..100).collect();
    iso.add_file("boot.img", boot_image).unwrap();
    iso.set_boot_config(BootConfig {
        boot_file_path: "boot.img".to_string(),
        platform_id: PlatformId::Efi,
        emulation: Emulation::NoEmulation,
        patch_boot_info_table: true,
    })
    .unwrap();

    let (bytes, first_done, total, call_count) = write_to_vec(&mut iso);
    assert_eq!(total, bytes.len() as u64);
    assert_eq!(total % 2048, 0);
    // One callback per sector actually written, not just a start/end pair.
    assert_eq!(call_count as u64, total / 2048);
    assert_eq!(first_done, 2048);

    let mut opened = Iso::open(Cursor::new(bytes), extensions).unwrap();
    let contents = opened
        .read_file("programs/a long mixed Case name.txt")
        .unwrap();
    assert_eq!(contents, b"payload");
}

#[test]
fn truncated_image_is_rejected_on_open() {
    let mut iso: Iso<Cursor<Vec<u8>>> = Iso::create(Extensions::empty());
    iso.add_file("foo", b"foo\n".to_vec()).unwrap();
    let (mut bytes, _, _, _) = write_to_vec(&mut iso);

    bytes.truncate(17 * 2048 - 1024);
    let result = Iso::open(Cursor::new(bytes), Extensions::empty());
    assert!(result.is_err());
}
