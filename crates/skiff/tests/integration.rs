//! Integration tests for the local adaptors through the public factory API.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

use skiff::{AdaptorError, CopyMode, Credential, JobDescription, RemotePath, adaptor};

fn path(p: &std::path::Path) -> RemotePath {
    RemotePath::new(&p.to_string_lossy())
}

#[test]
fn test_unknown_adaptor_is_rejected() {
    let result = adaptor::create_file_system("sftp", "", &Credential::default(), &BTreeMap::new());
    assert!(matches!(result, Err(AdaptorError::UnknownAdaptor(name)) if name == "sftp"));
    assert_eq!(adaptor::file_system_adaptor_names(), vec!["file".to_string()]);
    assert_eq!(adaptor::scheduler_adaptor_names(), vec!["local".to_string()]);
}

#[test]
fn test_copy_between_rooted_file_systems() {
    let left_dir = tempfile::tempdir().unwrap();
    let right_dir = tempfile::tempdir().unwrap();
    let none = BTreeMap::new();
    let left = adaptor::create_file_system(
        "file",
        &left_dir.path().to_string_lossy(),
        &Credential::default(),
        &none,
    )
    .unwrap();
    let right = adaptor::create_file_system(
        "file",
        &right_dir.path().to_string_lossy(),
        &Credential::default(),
        &none,
    )
    .unwrap();

    let source = RemotePath::new("/data");
    let mut sink = left.write_to_file(&source, None).unwrap();
    sink.write_all(b"across roots").unwrap();
    sink.close().unwrap();

    let target = RemotePath::new("/copied");
    let id = left
        .copy(&source, right.clone(), &target, CopyMode::Create, false)
        .unwrap();
    let status = left
        .wait_until_copy_done(&id, Duration::from_secs(10))
        .unwrap();
    assert!(status.done);
    assert!(status.error.is_none());
    assert_eq!(status.bytes_copied, 12);

    let mut copied = String::new();
    let mut source = right.read_from_file(&target).unwrap();
    source.read_to_string(&mut copied).unwrap();
    source.close().unwrap();
    assert_eq!(copied, "across roots");
    assert!(right_dir.path().join("copied").is_file());
}

#[test]
fn test_batch_job_output_lands_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler =
        adaptor::create_scheduler("local", "", &Credential::default(), &BTreeMap::new()).unwrap();

    let description = JobDescription {
        executable: "echo".to_string(),
        arguments: vec!["from the job".to_string()],
        working_directory: Some(dir.path().to_string_lossy().into_owned()),
        stdout: Some("out.txt".to_string()),
        ..Default::default()
    };
    let id = scheduler.submit_batch_job(&description).unwrap();
    let status = scheduler
        .wait_until_done(&id, Duration::from_secs(10))
        .unwrap();
    assert_eq!(status.state, "DONE");
    assert_eq!(status.exit_code, Some(0));

    let fs = scheduler.file_system().unwrap();
    let mut output = String::new();
    let mut source = fs.read_from_file(&path(&dir.path().join("out.txt"))).unwrap();
    source.read_to_string(&mut output).unwrap();
    source.close().unwrap();
    assert_eq!(output, "from the job\n");
}
