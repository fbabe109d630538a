use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn validate_uses_images_dir_from_environment() {
  let env = TestEnv::empty();
  env.write_image("base", "external:debian:bookworm");
  env.write_image("app", "base");

  env
    .stratum_cmd()
    .arg("validate")
    .assert()
    .success()
    .stdout(predicate::str::contains("2 image(s) valid"));
}

#[test]
fn validate_rejects_manifest_without_inherits() {
  let env = TestEnv::empty();
  env.write_file("images/bare/config.json", "{}");

  env
    .stratum_cmd()
    .arg("validate")
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid definition for image bare"));
}

#[test]
fn validate_skips_hidden_directories() {
  let env = TestEnv::empty();
  env.write_image("base", "external:debian:bookworm");
  env.write_file("images/.cache/config.json", "not json");

  env.stratum_cmd().arg("validate").assert().success();
}

#[test]
fn validate_json_lists_errors_per_image() {
  let env = TestEnv::empty();
  env.write_image("good", "external:debian:bookworm");
  env.write_image("orphan", "ghost");

  let output = env
    .stratum_cmd()
    .args(["-o", "json", "validate"])
    .assert()
    .failure()
    .get_output()
    .stdout
    .clone();

  let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(json["images"], serde_json::json!(["good", "orphan"]));
  assert_eq!(json["errors"][0]["image"], "orphan");
}

#[test]
fn list_on_empty_images_dir_says_so() {
  let env = TestEnv::empty();
  std::fs::create_dir_all(env.images_path()).unwrap();

  env
    .stratum_cmd()
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("No images"));
}
