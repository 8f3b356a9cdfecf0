//! Build lifecycle events and the transition function that applies them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::build::Build;

/// Events that can happen to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// Execution began.
    Started { at: DateTime<Utc> },
    /// Execution ended, successfully or not.
    Finished {
        at: DateTime<Utc>,
        successful: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("build has already started")]
    AlreadyStarted,
    #[error("build cannot finish before it starts")]
    NotStarted,
    #[error("build has already finished")]
    AlreadyFinished,
}

impl Build {
    /// Apply a lifecycle event. Terminal builds accept no further events.
    pub fn apply(&mut self, event: &BuildEvent) -> Result<(), TransitionError> {
        if self.finished.is_some() {
            return Err(TransitionError::AlreadyFinished);
        }
        match *event {
            BuildEvent::Started { at } => {
                if self.started.is_some() {
                    return Err(TransitionError::AlreadyStarted);
                }
                self.started = Some(at);
            }
            BuildEvent::Finished { at, successful } => {
                if self.started.is_none() {
                    return Err(TransitionError::NotStarted);
                }
                self.finished = Some(at);
                self.was_successful = Some(successful);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::BuildState;

    fn pending() -> Build {
        Build {
            id: 7,
            commit_id: 1,
            configuration_id: 1,
            started: None,
            finished: None,
            was_successful: None,
        }
    }

    #[test]
    fn walks_pending_active_terminal() {
        let mut build = pending();
        let now = Utc::now();
        build.apply(&BuildEvent::Started { at: now }).unwrap();
        assert_eq!(build.state(), BuildState::Active);
        build
            .apply(&BuildEvent::Finished {
                at: now,
                successful: true,
            })
            .unwrap();
        assert_eq!(build.state(), BuildState::Successful);
    }

    #[test]
    fn rejects_out_of_order_events() {
        let now = Utc::now();
        let mut build = pending();
        assert_eq!(
            build.apply(&BuildEvent::Finished {
                at: now,
                successful: true
            }),
            Err(TransitionError::NotStarted)
        );

        build.apply(&BuildEvent::Started { at: now }).unwrap();
        assert_eq!(
            build.apply(&BuildEvent::Started { at: now }),
            Err(TransitionError::AlreadyStarted)
        );

        build
            .apply(&BuildEvent::Finished {
                at: now,
                successful: false,
            })
            .unwrap();
        assert_eq!(
            build.apply(&BuildEvent::Finished {
                at: now,
                successful: true
            }),
            Err(TransitionError::AlreadyFinished)
        );
        assert_eq!(build.was_successful, Some(false));
    }
}
