//! Module that contains the scripted fault injection of central managers.
//!
//! Faults are deterministic: each one fires after a given number of handled
//! messages, which lets failover be exercised reproducibly.

use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, time::Duration};

/// Enum that tells how a central manager dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathMode {
    /// Stop serving, then come back after `resurrect_after_ms`.
    Soft { resurrect_after_ms: u64 },
    /// Exit for good.
    Hard,
}

/// Struct that represents one scripted death.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub central_manager: usize,
    /// Number of handled messages before the death.
    pub after_messages: u64,
    pub mode: DeathMode,
}

/// Struct that counts down towards the next fault of one central manager.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    countdown: Option<u64>,
    pending: VecDeque<(u64, DeathMode)>,
    current: Option<DeathMode>,
}

impl DeathMode {
    pub fn resurrect_after(&self) -> Option<Duration> {
        match self {
            DeathMode::Soft { resurrect_after_ms } => {
                Some(Duration::from_millis(*resurrect_after_ms))
            }
            DeathMode::Hard => None,
        }
    }
}

impl FaultPlan {
    /// Function that builds the plan of `central_manager` from the configured faults.
    pub fn for_central_manager(central_manager: usize, faults: &[Fault]) -> Self {
        let pending = faults
            .iter()
            .filter(|fault| fault.central_manager == central_manager)
            .map(|fault| (fault.after_messages, fault.mode))
            .collect();
        let mut plan = Self {
            countdown: None,
            pending,
            current: None,
        };
        plan.arm_next();
        plan
    }

    /// Function that never fires.
    pub fn immortal() -> Self {
        Self::default()
    }

    fn arm_next(&mut self) {
        match self.pending.pop_front() {
            Some((after, mode)) => {
                self.countdown = Some(after);
                self.current = Some(mode);
            }
            None => {
                self.countdown = None;
                self.current = None;
            }
        }
    }

    /// Function that accounts for one handled message.
    ///
    /// Returns the death to enact when the countdown reaches zero.
    pub fn tick(&mut self) -> Option<DeathMode> {
        let remaining = self.countdown.as_mut()?;
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return None;
        }
        let mode = self.current;
        self.arm_next();
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_fire_in_order_for_their_cm_only() {
        let faults = vec![
            Fault {
                central_manager: 0,
                after_messages: 2,
                mode: DeathMode::Soft {
                    resurrect_after_ms: 10,
                },
            },
            Fault {
                central_manager: 1,
                after_messages: 1,
                mode: DeathMode::Hard,
            },
            Fault {
                central_manager: 0,
                after_messages: 1,
                mode: DeathMode::Hard,
            },
        ];
        let mut plan = FaultPlan::for_central_manager(0, &faults);

        assert_eq!(plan.tick(), None);
        assert_eq!(
            plan.tick(),
            Some(DeathMode::Soft {
                resurrect_after_ms: 10
            })
        );
        assert_eq!(plan.tick(), Some(DeathMode::Hard));
        for _ in 0..10 {
            assert_eq!(plan.tick(), None);
        }
    }

    #[test]
    fn immortal_plan_never_fires() {
        let mut plan = FaultPlan::immortal();
        for _ in 0..1000 {
            assert_eq!(plan.tick(), None);
        }
    }

    #[test]
    fn config_spelling() {
        let fault: Fault = serde_json::from_str(
            r#"{"central_manager":2,"after_messages":50,"mode":{"soft":{"resurrect_after_ms":900}}}"#,
        )
        .unwrap();
        assert_eq!(fault.mode.resurrect_after(), Some(Duration::from_millis(900)));
        let hard: DeathMode = serde_json::from_str(r#""hard""#).unwrap();
        assert_eq!(hard, DeathMode::Hard);
    }
}
