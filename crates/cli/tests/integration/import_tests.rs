use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn import_unpacks_tarball_into_a_new_layer() {
  let env = TestEnv::empty();
  let tarball = env.write_tarball(
    "rootfs.tar",
    &[("etc/os-release", "ID=test\n"), ("usr/bin/hello", "#!/bin/sh\n")],
  );

  env
    .stratum_cmd()
    .args(["import", "os/base:1"])
    .arg(&tarball)
    .assert()
    .success()
    .stdout(predicate::str::contains("as os/base:1"));

  assert_eq!(env.layer_count(), 1);
  let layer = std::fs::read_dir(env.store_path().join("layers"))
    .unwrap()
    .next()
    .unwrap()
    .unwrap()
    .path();
  assert_eq!(
    std::fs::read_to_string(layer.join("etc/os-release")).unwrap(),
    "ID=test\n"
  );
}

#[test]
fn import_json_names_the_image() {
  let env = TestEnv::empty();
  let tarball = env.write_tarball("rootfs.tar", &[("etc/hostname", "box\n")]);

  env
    .stratum_cmd()
    .args(["-o", "json", "import", "os/base"])
    .arg(&tarball)
    .assert()
    .success()
    .stdout(predicate::str::contains(r#""image": "os/base""#));
}

#[test]
fn import_rejects_invalid_reference() {
  let env = TestEnv::empty();
  let tarball = env.write_tarball("rootfs.tar", &[("etc/hostname", "box\n")]);

  env
    .stratum_cmd()
    .args(["import", "has space"])
    .arg(&tarball)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid image reference"));

  assert_eq!(env.layer_count(), 0);
}

#[test]
fn import_fails_for_corrupt_tarball() {
  let env = TestEnv::empty();
  env.write_file("broken.tar", "this is not a tarball, just some bytes that are long enough to not be one");

  env
    .stratum_cmd()
    .args(["import", "os/base"])
    .arg(env.temp.path().join("broken.tar"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to import"));
}
