use std::io::Cursor;

use mpqkit::consts::LOCALE_NEUTRAL;
use mpqkit::{copy_patch, Archive, ErrorKind, FileOptions};

type MemoryArchive = Archive<Cursor<Vec<u8>>>;

fn build<F>(fill: F) -> MemoryArchive
where
    F: FnOnce(&mut Archive<&mut Cursor<Vec<u8>>>),
{
    let mut buf = Cursor::new(Vec::new());
    {
        let mut archive = Archive::create(&mut buf).unwrap();
        fill(&mut archive);
        archive.close().unwrap();
    }

    Archive::open(buf).unwrap()
}

fn base() -> MemoryArchive {
    build(|archive| {
        archive
            .add_file("war3map.j", b"base script", FileOptions::default())
            .unwrap();
        archive
            .add_file("war3map.w3e", b"terrain", FileOptions::default())
            .unwrap();
    })
}

#[test]
fn newer_layers_shadow_older_ones() {
    let mut archive = base();
    let patch = build(|archive| {
        archive
            .add_file("war3map.j", b"patched script", FileOptions::default())
            .unwrap();
    });

    archive.open_patch(patch, "").unwrap();
    assert!(archive.is_patched());

    assert_eq!(archive.read_file("war3map.j").unwrap(), b"patched script");
    assert_eq!(archive.read_file("war3map.w3e").unwrap(), b"terrain");
}

#[test]
fn delete_markers_hide_base_files() {
    let mut archive = base();
    let patch = build(|archive| {
        archive
            .add_delete_marker("war3map.w3e", LOCALE_NEUTRAL)
            .unwrap();
    });

    archive.open_patch(patch, "").unwrap();

    let error = archive.read_file("war3map.w3e").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert!(!archive.has_file("war3map.w3e").unwrap());
    assert_eq!(archive.read_file("war3map.j").unwrap(), b"base script");
}

#[test]
fn copy_patches_rewrite_base_content() {
    let mut archive = base();
    let patch = build(|archive| {
        let options = FileOptions {
            patch_file: true,
            compress: true,
            ..FileOptions::default()
        };
        let blob = copy_patch(b"base script", b"rewritten script");
        archive.add_file("war3map.j", &blob, options).unwrap();
    });

    archive.open_patch(patch, "").unwrap();
    assert_eq!(archive.read_file("war3map.j").unwrap(), b"rewritten script");
}

#[test]
fn prefixed_layers_look_under_their_prefix() {
    let mut archive = base();
    let patch = build(|archive| {
        archive
            .add_file("base\\war3map.j", b"prefixed script", FileOptions::default())
            .unwrap();
        archive
            .add_file("war3map.w3e", b"ignored", FileOptions::default())
            .unwrap();
    });

    archive.open_patch(patch, "base").unwrap();

    assert_eq!(archive.read_file("war3map.j").unwrap(), b"prefixed script");
    assert_eq!(archive.read_file("war3map.w3e").unwrap(), b"terrain");
}

#[test]
fn patch_files_are_invisible_without_a_chain() {
    let options = FileOptions {
        patch_file: true,
        ..FileOptions::default()
    };
    let blob = copy_patch(b"", b"standalone");
    let archive = build(|archive| {
        archive.add_file("war3map.j", &blob, options).unwrap();
    });

    // read as stored, the blob comes back untouched
    assert_eq!(archive.read_file("war3map.j").unwrap(), blob);
}
