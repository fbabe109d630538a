use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn gc_with_no_store_succeeds() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_dry_run_shows_what_would_be_removed() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("gc")
    .arg("--dry-run")
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}

#[test]
fn gc_json_output_is_valid() {
  let env = TestEnv::empty();

  let output = env
    .stratum_cmd()
    .arg("gc")
    .args(["-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("layers_deleted"))
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json["stats"]["layers_deleted"], 0);
}

#[test]
fn gc_removes_orphan_layers() {
  let env = TestEnv::empty();
  env.write_file("store/layers/orphan/etc/hostname", "ghost\n");

  env.stratum_cmd().arg("gc").assert().success();

  assert_eq!(env.layer_count(), 0);
}

#[test]
fn gc_dry_run_keeps_orphan_layers() {
  let env = TestEnv::empty();
  env.write_file("store/layers/orphan/etc/hostname", "ghost\n");

  let output = env
    .stratum_cmd()
    .args(["-o", "json", "gc", "--dry-run"])
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json["stats"]["layers_deleted"], 1);
  assert_eq!(env.layer_count(), 1);
}

#[test]
fn gc_keeps_layers_of_imported_images() {
  let env = TestEnv::empty();
  let tarball = env.write_tarball("rootfs.tar", &[("etc/os-release", "ID=test\n")]);

  env
    .stratum_cmd()
    .args(["import", "os/base:1"])
    .arg(&tarball)
    .assert()
    .success();
  env.write_file("store/layers/orphan/junk", "x");

  env.stratum_cmd().arg("gc").assert().success();

  assert_eq!(env.layer_count(), 1);
}
