//! Adapter lifecycle.
//!
//! ```text
//!  NEW → SETTING_UP → READY ⇄ EXECUTING → TORN_DOWN
//!                          ↘  FAULTED → TORN_DOWN
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    New,
    SettingUp,
    Ready,
    Executing,
    Faulted,
    TornDown,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::New => "NEW",
            AdapterState::SettingUp => "SETTING_UP",
            AdapterState::Ready => "READY",
            AdapterState::Executing => "EXECUTING",
            AdapterState::Faulted => "FAULTED",
            AdapterState::TornDown => "TORN_DOWN",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {state}")]
pub struct InvalidTransition {
    pub state: AdapterState,
    pub action: &'static str,
}

/// Current state plus every state visited, in order.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: AdapterState,
    history: Vec<AdapterState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AdapterState::New,
            history: vec![AdapterState::New],
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn history(&self) -> &[AdapterState] {
        &self.history
    }

    fn go(&mut self, next: AdapterState) {
        tracing::trace!(from = %self.state, to = %next, "Adapter transition");
        self.state = next;
        self.history.push(next);
    }

    fn expect(&self, wanted: AdapterState, action: &'static str) -> Result<(), InvalidTransition> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(InvalidTransition {
                state: self.state,
                action,
            })
        }
    }

    /// NEW → SETTING_UP.
    pub fn begin_setup(&mut self) -> Result<(), InvalidTransition> {
        self.expect(AdapterState::New, "set up")?;
        self.go(AdapterState::SettingUp);
        Ok(())
    }

    /// SETTING_UP → READY, or FAULTED when setup failed.
    pub fn finish_setup(&mut self, ok: bool) {
        if self.state == AdapterState::SettingUp {
            self.go(if ok {
                AdapterState::Ready
            } else {
                AdapterState::Faulted
            });
        }
    }

    /// READY → EXECUTING.
    pub fn begin_execute(&mut self) -> Result<(), InvalidTransition> {
        self.expect(AdapterState::Ready, "execute a command")?;
        self.go(AdapterState::Executing);
        Ok(())
    }

    /// EXECUTING → READY, or FAULTED after an unrecoverable error.
    pub fn finish_execute(&mut self, recoverable: bool) {
        if self.state == AdapterState::Executing {
            self.go(if recoverable {
                AdapterState::Ready
            } else {
                AdapterState::Faulted
            });
        }
    }

    /// Any state → TORN_DOWN. Returns false if already torn down.
    pub fn tear_down(&mut self) -> bool {
        if self.state == AdapterState::TornDown {
            return false;
        }
        self.go(AdapterState::TornDown);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AdapterState::*;

    #[test]
    fn test_happy_path() {
        let mut life = Lifecycle::new();
        life.begin_setup().unwrap();
        life.finish_setup(true);
        life.begin_execute().unwrap();
        life.finish_execute(true);
        life.begin_execute().unwrap();
        life.finish_execute(true);
        assert!(life.tear_down());

        assert_eq!(
            life.history(),
            &[New, SettingUp, Ready, Executing, Ready, Executing, Ready, TornDown]
        );
    }

    #[test]
    fn test_fault_still_tears_down() {
        let mut life = Lifecycle::new();
        life.begin_setup().unwrap();
        life.finish_setup(false);
        assert_eq!(life.state(), Faulted);

        let err = life.begin_execute().unwrap_err();
        assert_eq!(err.state, Faulted);

        assert!(life.tear_down());
        assert!(!life.tear_down());
        assert_eq!(life.state(), TornDown);
    }

    #[test]
    fn test_setup_only_once() {
        let mut life = Lifecycle::new();
        life.begin_setup().unwrap();
        life.finish_setup(true);
        assert_eq!(
            life.begin_setup().unwrap_err().to_string(),
            "cannot set up while READY"
        );
    }
}
