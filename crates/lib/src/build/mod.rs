//! Build orchestration.
//!
//! A build run takes a validated [`ImageGraph`], decides which images need
//! building, and builds them one at a time in inheritance order. Each image
//! gets its own session seeded from its resolved parent: the build script
//! runs, the result is committed as `<prefix><name>`, requested tags are
//! applied, and the session is torn down.
//!
//! # Failure policy
//!
//! The first image that fails halts the run. Nothing after it in the plan is
//! attempted, so no image ever builds on top of a parent that failed.

mod types;

use std::path::Path;

use tracing::{error, info};

use crate::backend::{BindMount, ExecutionBackend, SessionConfig};
use crate::cancel::Cancellation;
use crate::consts::{BUILD_SCRIPT, IMAGES_MOUNT, PACKAGES_MOUNT};
use crate::image::{DefinitionError, ImageDefinition, ImageGraph, ImageRef, Parent};
use crate::session::with_session;

pub use types::*;

/// What a build run does with one planned image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
  Build,
  /// Already in the store; used as a parent without rebuilding.
  Reuse,
}

#[derive(Debug, Clone, Copy)]
pub struct PlannedImage<'g> {
  pub definition: &'g ImageDefinition,
  pub action: PlanAction,
}

/// The reference a managed image is committed under: `<prefix><name>`.
pub fn output_ref(name: &str, prefix: &str) -> Result<ImageRef, BuildError> {
  let value = format!("{}{}", prefix, name);
  ImageRef::parse(&value).map_err(|source| BuildError::InvalidReference { value, source })
}

/// The image a definition's build session is seeded from.
///
/// Managed parents get the run's prefix; external references pass through unchanged.
pub fn resolve_parent(definition: &ImageDefinition, prefix: &str) -> Result<ImageRef, BuildError> {
  match &definition.inherits {
    Parent::External(reference) => Ok(reference.clone()),
    Parent::Image(parent) => output_ref(parent, prefix),
  }
}

/// The command that runs an image's build script inside its session.
pub fn build_command(name: &str) -> Vec<String> {
  vec![
    "/usr/bin/env".to_string(),
    "bash".to_string(),
    "-c".to_string(),
    format!("cd {}/{} && ./{}", IMAGES_MOUNT, name, BUILD_SCRIPT),
  ]
}

fn session_config(definition: &ImageDefinition, parent: ImageRef, options: &BuildOptions) -> SessionConfig {
  let mut config = SessionConfig::new(parent, definition.name.clone());
  config
    .mounts
    .push(BindMount::new(&definition.images_dir, IMAGES_MOUNT, true));
  if let Some(cache) = &options.package_cache {
    config.mounts.push(BindMount::new(cache, PACKAGES_MOUNT, false));
  }
  config.env = options.env.clone();
  config
}

/// Decide what to build.
///
/// With no target every image is built in dependency order. With a target,
/// its ancestors are walked root-first: one already in the store is reused
/// unless `rebuild_parents` is set, but once any ancestor is rebuilt every
/// image below it is rebuilt too. The target itself is always built.
pub async fn plan<'g, B>(
  backend: &B,
  graph: &'g ImageGraph,
  target: Option<&str>,
  options: &BuildOptions,
  cancel: &Cancellation,
) -> Result<Vec<PlannedImage<'g>>, BuildError>
where
  B: ExecutionBackend + ?Sized,
{
  let Some(target) = target else {
    return Ok(
      graph
        .build_order()
        .into_iter()
        .map(|definition| PlannedImage {
          definition,
          action: PlanAction::Build,
        })
        .collect(),
    );
  };

  let target_definition = graph
    .get(target)
    .ok_or_else(|| DefinitionError::UnknownImage(target.to_string()))?;

  let mut planned = Vec::new();
  let mut rebuilding = options.rebuild_parents;

  for ancestor in graph.ancestors(target)? {
    let action = if rebuilding {
      PlanAction::Build
    } else {
      let image = output_ref(&ancestor.name, &options.prefix)?;
      let exists = cancel
        .run(backend.image_exists(&image))
        .await
        .map_err(|_| BuildError::Cancelled)?
        .map_err(|source| BuildError::Lookup { image, source })?;
      if exists {
        PlanAction::Reuse
      } else {
        rebuilding = true;
        PlanAction::Build
      }
    };
    planned.push(PlannedImage {
      definition: ancestor,
      action,
    });
  }

  planned.push(PlannedImage {
    definition: target_definition,
    action: PlanAction::Build,
  });
  Ok(planned)
}

fn prepare_package_cache(path: &Path) -> Result<(), BuildError> {
  if !crate::util::fs::directory_exists(path) {
    info!(path = %path.display(), "creating package cache");
    std::fs::create_dir_all(path).map_err(|source| BuildError::Prepare {
      path: path.to_path_buf(),
      source,
    })?;
  }
  Ok(())
}

/// Build `target` (with whatever ancestors it needs) or, with `None`, every image.
///
/// # Errors
///
/// Planning and preparation failures are returned before any session starts.
/// A failure while building an image is not an `Err`: it is recorded in the
/// report's `failed` field and the rest of the plan is listed as skipped.
pub async fn build_images<B>(
  backend: &B,
  graph: &ImageGraph,
  target: Option<&str>,
  options: &BuildOptions,
  cancel: &Cancellation,
) -> Result<BuildReport, BuildError>
where
  B: ExecutionBackend + ?Sized,
{
  if let Some(cache) = &options.package_cache {
    prepare_package_cache(cache)?;
  }

  let planned = plan(backend, graph, target, options, cancel).await?;
  info!(
    images = planned.len(),
    target = target.unwrap_or("all"),
    "build planned"
  );

  let mut report = BuildReport::default();
  let mut remaining = planned.iter();

  while let Some(item) = remaining.next() {
    let name = &item.definition.name;

    if item.action == PlanAction::Reuse {
      let image = output_ref(name, &options.prefix)?;
      info!(image = %image, "reusing image already in the store");
      report.reused.push(image);
      continue;
    }

    match build_image(backend, item.definition, options, cancel).await {
      Ok(image) => report.built.push(image),
      Err(err) => {
        error!(image = %name, error = %err, "build failed");
        report.skipped = remaining
          .by_ref()
          .map(|rest| SkippedImage {
            name: rest.definition.name.clone(),
            blocked_by: name.clone(),
          })
          .collect();
        report.failed = Some((name.clone(), err));
        break;
      }
    }
  }

  Ok(report)
}

/// Build one image in its own session and return the committed reference.
pub async fn build_image<B>(
  backend: &B,
  definition: &ImageDefinition,
  options: &BuildOptions,
  cancel: &Cancellation,
) -> Result<ImageRef, BuildError>
where
  B: ExecutionBackend + ?Sized,
{
  let parent = resolve_parent(definition, &options.prefix)?;
  let output = output_ref(&definition.name, &options.prefix)?;
  let tags = options
    .tags
    .iter()
    .map(|tag| {
      output.tagged(tag).map_err(|source| BuildError::InvalidReference {
        value: format!("{}:{}", output, tag),
        source,
      })
    })
    .collect::<Result<Vec<_>, _>>()?;

  info!(image = %output, parent = %parent, "building image");

  let config = session_config(definition, parent, options);
  let command = build_command(&definition.name);
  let committed = output.clone();

  with_session(backend, &config, cancel, |session| async move {
    session.run(&command).await?;
    session.commit(&committed).await?;
    session.tag(&committed, &tags).await
  })
  .await
  .map_err(|failure| BuildError::Step {
    image: definition.name.clone(),
    step: failure.error.step().into(),
    source: failure.error,
    cleanup: failure.cleanup,
  })?;

  info!(image = %output, "image built");
  Ok(output)
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;
  use std::path::PathBuf;

  use tempfile::TempDir;

  use super::*;
  use crate::cancel;
  use crate::session::SessionError;
  use crate::util::testutil::{Call, FakeBackend, Op};

  fn graph(items: &[(&str, &str)]) -> ImageGraph {
    let definitions: BTreeMap<String, ImageDefinition> = items
      .iter()
      .map(|(name, inherits)| {
        let definition = ImageDefinition {
          name: name.to_string(),
          image_dir: PathBuf::from("/srv/images").join(name),
          images_dir: PathBuf::from("/srv/images"),
          inherits: Parent::parse(inherits).unwrap(),
        };
        (name.to_string(), definition)
      })
      .collect();
    ImageGraph::from_definitions(definitions).unwrap()
  }

  fn base_and_child() -> ImageGraph {
    graph(&[("base", "external:os/base"), ("child", "base")])
  }

  fn image(s: &str) -> ImageRef {
    ImageRef::parse(s).unwrap()
  }

  fn options(prefix: &str) -> BuildOptions {
    BuildOptions {
      prefix: prefix.to_string(),
      ..Default::default()
    }
  }

  fn names(images: &[ImageRef]) -> Vec<String> {
    images.iter().map(ToString::to_string).collect()
  }

  /// Index of the first call matching `pred`.
  fn position(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
    calls.iter().position(pred).unwrap()
  }

  #[test]
  fn parent_resolution_prefixes_only_managed_images() {
    let graph = base_and_child();

    assert_eq!(
      resolve_parent(graph.get("base").unwrap(), "team/").unwrap(),
      image("os/base")
    );
    assert_eq!(
      resolve_parent(graph.get("child").unwrap(), "team/").unwrap(),
      image("team/base")
    );
  }

  #[test]
  fn build_command_runs_the_script_from_the_image_directory() {
    assert_eq!(
      build_command("child"),
      vec!["/usr/bin/env", "bash", "-c", "cd /images/child && ./script"]
    );
  }

  #[tokio::test]
  async fn target_builds_missing_parent_first() {
    let backend = FakeBackend::with_images(&["os/base"]);

    let report = build_images(&backend, &base_and_child(), Some("child"), &options("t/"), &Cancellation::never())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(names(&report.built), vec!["t/base", "t/child"]);
    assert!(backend.has_image(&image("t/base")));
    assert!(backend.has_image(&image("t/child")));

    let configs = backend.started_configs();
    assert_eq!(configs[0].image, image("os/base"));
    assert_eq!(configs[1].image, image("t/base"));
  }

  #[tokio::test]
  async fn parent_commit_precedes_child_session() {
    let backend = FakeBackend::with_images(&["os/base"]);
    let graph = graph(&[
      ("base", "external:os/base"),
      ("mid", "base"),
      ("leaf", "mid"),
      ("side", "base"),
    ]);

    build_images(&backend, &graph, None, &options(""), &Cancellation::never())
      .await
      .unwrap();

    let calls = backend.calls();
    for (parent, child) in [("base", "mid"), ("mid", "leaf"), ("base", "side")] {
      let committed = position(&calls, |c| matches!(c, Call::Commit { image: i, .. } if *i == image(parent)));
      let started = position(&calls, |c| matches!(c, Call::Start { image: i, .. } if *i == image(parent)));
      assert!(committed < started, "{parent} must be committed before {child} starts");
    }
  }

  #[tokio::test]
  async fn existing_ancestor_is_reused() {
    let backend = FakeBackend::with_images(&["os/base", "t/base"]);

    let report = build_images(&backend, &base_and_child(), Some("child"), &options("t/"), &Cancellation::never())
      .await
      .unwrap();

    assert_eq!(names(&report.reused), vec!["t/base"]);
    assert_eq!(names(&report.built), vec!["t/child"]);
    assert_eq!(backend.count(Op::Start), 1);
  }

  #[tokio::test]
  async fn rebuild_parents_ignores_the_store() {
    let backend = FakeBackend::with_images(&["os/base", "t/base"]);
    let options = BuildOptions {
      rebuild_parents: true,
      ..options("t/")
    };

    let report = build_images(&backend, &base_and_child(), Some("child"), &options, &Cancellation::never())
      .await
      .unwrap();

    assert!(report.reused.is_empty());
    assert_eq!(names(&report.built), vec!["t/base", "t/child"]);
  }

  #[tokio::test]
  async fn everything_below_a_rebuilt_ancestor_is_rebuilt() {
    let backend = FakeBackend::with_images(&["os/base", "t/mid"]);
    let graph = graph(&[("base", "external:os/base"), ("mid", "base"), ("leaf", "mid")]);

    let report = build_images(&backend, &graph, Some("leaf"), &options("t/"), &Cancellation::never())
      .await
      .unwrap();

    assert!(report.reused.is_empty());
    assert_eq!(names(&report.built), vec!["t/base", "t/mid", "t/leaf"]);
  }

  #[tokio::test]
  async fn failed_parent_skips_its_children() {
    let backend = FakeBackend::with_images(&["os/base"]);
    backend.exit_with("cd /images/base &&", 1);

    let report = build_images(&backend, &base_and_child(), None, &options(""), &Cancellation::never())
      .await
      .unwrap();

    let (failed, err) = report.failed.as_ref().unwrap();
    assert_eq!(failed, "base");
    assert_eq!(err.step(), Some(BuildStep::Script));
    assert!(matches!(
      err,
      BuildError::Step {
        source: SessionError::ExecutionFailed { code: 1, .. },
        ..
      }
    ));
    assert_eq!(
      report.skipped,
      vec![SkippedImage {
        name: "child".to_string(),
        blocked_by: "base".to_string(),
      }]
    );
    assert!(report.built.is_empty());
    assert_eq!(backend.count(Op::Start), 1);
    assert_eq!(backend.count(Op::Destroy), 1);
    assert_eq!(backend.count(Op::Commit), 0);
  }

  #[tokio::test]
  async fn unrelated_images_after_a_failure_are_skipped_too() {
    let backend = FakeBackend::with_images(&["os/base"]);
    backend.exit_with("cd /images/alpha &&", 1);
    let graph = graph(&[("alpha", "external:os/base"), ("beta", "external:os/base")]);

    let report = build_images(&backend, &graph, None, &options(""), &Cancellation::never())
      .await
      .unwrap();

    assert_eq!(report.failed.as_ref().unwrap().0, "alpha");
    assert_eq!(
      report.skipped,
      vec![SkippedImage {
        name: "beta".to_string(),
        blocked_by: "alpha".to_string(),
      }]
    );
    assert_eq!(backend.count(Op::Start), 1);
  }

  #[tokio::test]
  async fn teardown_failure_halts_the_run() {
    let backend = FakeBackend::with_images(&["os/base"]);
    backend.fail(Op::Destroy);

    let report = build_images(&backend, &base_and_child(), None, &options(""), &Cancellation::never())
      .await
      .unwrap();

    let (failed, err) = report.failed.as_ref().unwrap();
    assert_eq!(failed, "base");
    assert_eq!(err.step(), Some(BuildStep::Teardown));
    assert_eq!(report.skipped.len(), 1);
  }

  #[tokio::test]
  async fn commit_failure_keeps_teardown_error_secondary() {
    let backend = FakeBackend::with_images(&["os/base"]);
    backend.fail(Op::Commit);
    backend.fail(Op::Destroy);

    let report = build_images(&backend, &base_and_child(), Some("base"), &options(""), &Cancellation::never())
      .await
      .unwrap();

    match report.failed {
      Some((_, BuildError::Step { step, cleanup, .. })) => {
        assert_eq!(step, BuildStep::Commit);
        assert!(matches!(cleanup, Some(SessionError::Cleanup { .. })));
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[tokio::test]
  async fn tags_are_applied_from_the_committed_image() {
    let backend = FakeBackend::with_images(&["os/base"]);
    let options = BuildOptions {
      tags: vec!["v1".to_string(), "latest".to_string()],
      ..options("t/")
    };

    build_images(&backend, &base_and_child(), Some("base"), &options, &Cancellation::never())
      .await
      .unwrap();

    let tags: Vec<Call> = backend.calls().into_iter().filter(|c| c.op() == Op::Tag).collect();
    assert_eq!(
      tags,
      vec![
        Call::Tag {
          source: image("t/base"),
          target: image("t/base:v1"),
        },
        Call::Tag {
          source: image("t/base"),
          target: image("t/base:latest"),
        },
      ]
    );
  }

  #[tokio::test]
  async fn invalid_tag_fails_before_any_session() {
    let backend = FakeBackend::with_images(&["os/base"]);
    let options = BuildOptions {
      tags: vec!["bad/tag".to_string()],
      ..options("")
    };

    let report = build_images(&backend, &base_and_child(), Some("base"), &options, &Cancellation::never())
      .await
      .unwrap();

    assert!(matches!(report.failed, Some((_, BuildError::InvalidReference { .. }))));
    assert_eq!(backend.count(Op::Start), 0);
  }

  #[tokio::test]
  async fn sessions_get_mounts_and_env() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("pkg-cache");
    let backend = FakeBackend::with_images(&["os/base"]);
    let mut env = BTreeMap::new();
    env.insert("MIRROR".to_string(), "https://mirror.example".to_string());
    let options = BuildOptions {
      env: env.clone(),
      package_cache: Some(cache.clone()),
      ..options("")
    };

    build_images(&backend, &base_and_child(), Some("base"), &options, &Cancellation::never())
      .await
      .unwrap();

    assert!(cache.is_dir());
    let config = &backend.started_configs()[0];
    assert_eq!(config.env, env);
    assert_eq!(
      config.mounts,
      vec![
        BindMount::new("/srv/images", "/images", true),
        BindMount::new(&cache, "/packages", false),
      ]
    );
  }

  #[tokio::test]
  async fn unknown_target_is_rejected() {
    let backend = FakeBackend::with_images(&["os/base"]);

    let err = build_images(&backend, &base_and_child(), Some("ghost"), &options(""), &Cancellation::never())
      .await
      .unwrap_err();

    assert!(matches!(err, BuildError::Definition(DefinitionError::UnknownImage(_))));
    assert!(backend.calls().is_empty());
  }

  #[tokio::test]
  async fn lookup_failure_aborts_planning() {
    let backend = FakeBackend::with_images(&["os/base"]);
    backend.fail(Op::ImageExists);

    let err = build_images(&backend, &base_and_child(), Some("child"), &options(""), &Cancellation::never())
      .await
      .unwrap_err();

    assert!(matches!(err, BuildError::Lookup { .. }));
    assert_eq!(backend.count(Op::Start), 0);
  }

  #[tokio::test]
  async fn cancellation_halts_and_skips_the_rest() {
    let backend = FakeBackend::with_images(&["os/base"]);
    let (handle, signal) = cancel::channel();
    handle.cancel();

    let report = build_images(&backend, &base_and_child(), None, &options(""), &signal)
      .await
      .unwrap();

    match &report.failed {
      Some((name, BuildError::Step { source, .. })) => {
        assert_eq!(name, "base");
        assert!(matches!(source, SessionError::Cancelled { .. }));
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(backend.live_sessions(), 0);
  }
}
