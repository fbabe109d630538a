//! Execution sessions: one ephemeral privileged environment per operation.
//!
//! [`with_session`] is the only way to open one. It destroys the environment
//! exactly once on every path out of the body, including failures and
//! cancellation, and layers a teardown failure under the body's error
//! instead of replacing it.

use std::fmt;
use std::future::Future;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendError, ExecutionBackend, SessionConfig, SessionHandle};
use crate::cancel::Cancellation;
use crate::image::ImageRef;

/// The session operation an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
  Start,
  Run,
  Commit,
  Tag,
  Destroy,
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Step::Start => "start",
      Step::Run => "run",
      Step::Commit => "commit",
      Step::Tag => "tag",
      Step::Destroy => "destroy",
    };
    write!(f, "{}", name)
  }
}

#[derive(Debug, Error)]
pub enum SessionError {
  /// The command ran and exited non-zero.
  #[error("{command} exited with code {code}")]
  ExecutionFailed { step: Step, command: String, code: i32 },

  #[error("{step} failed: {source}")]
  Backend {
    step: Step,
    #[source]
    source: BackendError,
  },

  /// Teardown after an otherwise successful session failed.
  #[error("failed to destroy session {session}: {source}")]
  Cleanup {
    session: String,
    #[source]
    source: BackendError,
  },

  #[error("{step} cancelled")]
  Cancelled { step: Step },
}

impl SessionError {
  pub fn step(&self) -> Step {
    match self {
      SessionError::ExecutionFailed { step, .. }
      | SessionError::Backend { step, .. }
      | SessionError::Cancelled { step } => *step,
      SessionError::Cleanup { .. } => Step::Destroy,
    }
  }
}

/// A session's error plus, when teardown also failed, the teardown error.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SessionFailure {
  pub error: SessionError,
  pub cleanup: Option<SessionError>,
}

impl SessionFailure {
  pub fn new(error: SessionError) -> Self {
    Self { error, cleanup: None }
  }
}

/// Handle to a live environment, valid inside a [`with_session`] body.
pub struct Session<'a, B: ?Sized> {
  backend: &'a B,
  handle: SessionHandle,
  cancel: Cancellation,
}

impl<B: ?Sized> Clone for Session<'_, B> {
  fn clone(&self) -> Self {
    Self {
      backend: self.backend,
      handle: self.handle.clone(),
      cancel: self.cancel.clone(),
    }
  }
}

impl<'a, B: ExecutionBackend + ?Sized> Session<'a, B> {
  /// Run `command`; a non-zero exit is [`SessionError::ExecutionFailed`].
  pub async fn run(&self, command: &[String]) -> Result<(), SessionError> {
    let step = Step::Run;
    let code = self
      .cancel
      .run(self.backend.exec(&self.handle, command))
      .await
      .map_err(|_| SessionError::Cancelled { step })?
      .map_err(|source| SessionError::Backend { step, source })?;

    if code != 0 {
      return Err(SessionError::ExecutionFailed {
        step,
        command: command.join(" "),
        code,
      });
    }
    Ok(())
  }

  pub async fn commit(&self, image: &ImageRef) -> Result<(), SessionError> {
    let step = Step::Commit;
    self
      .cancel
      .run(self.backend.commit(&self.handle, image))
      .await
      .map_err(|_| SessionError::Cancelled { step })?
      .map_err(|source| SessionError::Backend { step, source })
  }

  /// Apply each of `targets` to `source`, stopping at the first failure.
  pub async fn tag(&self, source: &ImageRef, targets: &[ImageRef]) -> Result<(), SessionError> {
    let step = Step::Tag;
    for target in targets {
      self
        .cancel
        .run(self.backend.tag(source, target))
        .await
        .map_err(|_| SessionError::Cancelled { step })?
        .map_err(|source| SessionError::Backend { step, source })?;
      info!(image = %target, "tagged");
    }
    Ok(())
  }
}

/// Combine a body outcome with the teardown outcome.
///
/// The body's error always wins; a teardown error is attached beneath it.
fn settle<T>(outcome: Result<T, SessionError>, destroyed: Result<(), SessionError>) -> Result<T, SessionFailure> {
  match (outcome, destroyed) {
    (Ok(value), Ok(())) => Ok(value),
    (Ok(_), Err(cleanup)) => Err(SessionFailure::new(cleanup)),
    (Err(error), Ok(())) => Err(SessionFailure::new(error)),
    (Err(error), Err(cleanup)) => {
      warn!(error = %cleanup, "teardown also failed");
      Err(SessionFailure {
        error,
        cleanup: Some(cleanup),
      })
    }
  }
}

/// Start an environment from `config`, run `body` in it, and always destroy it.
///
/// Start and destroy are not subject to `cancel`: a start that is already in
/// flight when cancellation arrives completes, and the new session is
/// destroyed before [`SessionError::Cancelled`] is returned.
pub async fn with_session<'a, B, F, Fut, T>(
  backend: &'a B,
  config: &SessionConfig,
  cancel: &Cancellation,
  body: F,
) -> Result<T, SessionFailure>
where
  B: ExecutionBackend + ?Sized,
  F: FnOnce(Session<'a, B>) -> Fut,
  Fut: Future<Output = Result<T, SessionError>>,
{
  let step = Step::Start;
  if cancel.is_cancelled() {
    return Err(SessionFailure::new(SessionError::Cancelled { step }));
  }
  let handle = backend
    .start(config)
    .await
    .map_err(|source| SessionFailure::new(SessionError::Backend { step, source }))?;

  info!(session = %handle.id, image = %config.image, "session started");

  let outcome = if cancel.is_cancelled() {
    Err(SessionError::Cancelled { step })
  } else {
    let session = Session {
      backend,
      handle: handle.clone(),
      cancel: cancel.clone(),
    };
    body(session).await
  };

  let destroyed = backend
    .destroy(&handle)
    .await
    .map_err(|source| SessionError::Cleanup {
      session: handle.id.clone(),
      source,
    });
  if destroyed.is_ok() {
    info!(session = %handle.id, "session destroyed");
  }

  settle(outcome, destroyed)
}
