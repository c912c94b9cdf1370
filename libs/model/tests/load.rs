//! Loading models from disk.

use std::io::Write;

use volsnap_model::{FsType, Model, ModelError};

#[test]
fn test_load_model_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[management_server]
hostname = "ms1"

[[management_server.volume_groups]]
id = "vg_root"
volume_group_name = "vg_root"

[[management_server.volume_groups.file_systems]]
id = "software"
type = "xfs"
mount_point = "/software"
size = "50G"
snap_size = 1
"#
    )
    .unwrap();

    let model = Model::load(file.path()).unwrap();
    let fs = &model.management_server.volume_groups[0].file_systems[0];
    assert_eq!(fs.fs_type, FsType::Xfs);
    assert_eq!(fs.snap_size, 1);
    assert!(model.clusters.is_empty());
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Model::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ModelError::Io { .. }));
}

#[test]
fn test_load_rejects_schema_mismatch() {
    let err = Model::from_toml_str("[management_server]\nname = \"ms1\"\n").unwrap_err();
    assert!(matches!(err, ModelError::Parse(_)));
}

#[test]
fn test_load_rejects_bad_hostname() {
    let err = Model::from_toml_str("[management_server]\nhostname = \"ms 1\"\n").unwrap_err();
    assert!(err.to_string().contains("invalid node name"));
}
