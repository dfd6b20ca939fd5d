use std::fs;
use std::path::Path;
use wty_core::path_safety::{validate_path, PathPolicy};

#[cfg(target_family = "unix")]
fn symlink_dir<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[test]
fn plain_relative_names_resolve_under_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let p = validate_path(root, Path::new("boot.fex"), PathPolicy::default()).unwrap();
    assert_eq!(p, root.join("boot.fex"));
    let p = validate_path(root, Path::new("a/b/c.fex"), PathPolicy::default()).unwrap();
    assert_eq!(p, root.join("a/b/c.fex"));
}

#[test]
fn traversal_absolute_and_empty_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    for bad in ["../x.fex", "a/../../x.fex", "/etc/passwd", ""] {
        let err = validate_path(root, Path::new(bad), PathPolicy::default())
            .expect_err("expected error");
        let msg = format!("{:#}", err);
        assert!(msg.contains("unsafe path"), "unexpected error for {bad:?}: {msg}");
    }
}

#[cfg(target_family = "unix")]
#[test]
fn symlink_rejected_by_default_allowed_when_contained() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join("target")).unwrap();
    fs::write(root.join("target/file.fex"), b"hello").unwrap();
    symlink_dir(root.join("target"), root.join("safe")).unwrap();

    let err = validate_path(&root, Path::new("safe/file.fex"), PathPolicy::default())
        .expect_err("expected error");
    let msg = format!("{:#}", err);
    assert!(msg.contains("symlink"), "unexpected error: {}", msg);

    let policy = PathPolicy { follow_symlinks: true };
    let p = validate_path(&root, Path::new("safe/file.fex"), policy).unwrap();
    assert_eq!(p, root.join("safe/file.fex"));
}

#[cfg(target_family = "unix")]
#[test]
fn symlink_escape_blocked_even_when_following() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    let outside = tmp.path().join("outside");
    fs::create_dir_all(&root).unwrap();
    fs::create_dir_all(&outside).unwrap();
    symlink_dir(&outside, root.join("link")).unwrap();

    let policy = PathPolicy { follow_symlinks: true };
    let err = validate_path(&root, Path::new("link/new.fex"), policy).expect_err("expected error");
    let msg = format!("{:#}", err);
    assert!(msg.contains("escapes root"), "unexpected error: {}", msg);
}
