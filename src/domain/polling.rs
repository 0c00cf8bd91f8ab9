//! Telemetry Polling Sequencer
//!
//! The device pushes inertial frames on its own at the configured rate. Every
//! other sub-frame is a register read, so each decoded sample triggers the
//! request for the next one until the cycle wraps back to the inertial push.

use crate::domain::models::SensorSample;
use crate::infrastructure::bluetooth::protocol::{Command, SubFrame};

/// Which sub-frame the cycle expects next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingCycle {
    #[default]
    AwaitInertial,
    AwaitMagnetic,
    AwaitQuaternion,
    AwaitTemperature,
}

#[derive(Debug, Default)]
pub struct PollingSequencer {
    cycle: PollingCycle,
}

impl PollingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle(&self) -> PollingCycle {
        self.cycle
    }

    /// Advance on a decoded sample and return the request to write, if any
    ///
    /// The frame type comes from the decoder, not from the expected phase, so a
    /// reply arriving out of order still moves the cycle to the right place.
    pub fn on_sample(&mut self, sample: &SensorSample) -> Option<Command> {
        let (next, request) = match sample {
            SensorSample::Inertial(_) => (PollingCycle::AwaitMagnetic, Some(SubFrame::Magnetic)),
            SensorSample::Magnetic(_) => {
                (PollingCycle::AwaitQuaternion, Some(SubFrame::Quaternion))
            }
            SensorSample::Quaternion(_) => {
                (PollingCycle::AwaitTemperature, Some(SubFrame::Temperature))
            }
            SensorSample::Temperature { .. } => (PollingCycle::AwaitInertial, None),
            SensorSample::Unknown { .. } => return None,
        };

        self.cycle = next;
        request.map(Command::RequestSubFrame)
    }

    pub fn reset(&mut self) {
        self.cycle = PollingCycle::AwaitInertial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{InertialSample, MagneticSample, QuaternionSample};

    fn inertial() -> SensorSample {
        SensorSample::Inertial(InertialSample::default())
    }

    fn magnetic() -> SensorSample {
        SensorSample::Magnetic(MagneticSample::default())
    }

    fn quaternion() -> SensorSample {
        SensorSample::Quaternion(QuaternionSample::default())
    }

    fn temperature() -> SensorSample {
        SensorSample::Temperature { celsius: 21.5 }
    }

    #[test]
    fn test_full_cycle_requests() {
        let mut seq = PollingSequencer::new();
        let stimulus = [
            inertial(),
            magnetic(),
            quaternion(),
            temperature(),
            inertial(),
            magnetic(),
        ];
        let requests: Vec<Option<Command>> = stimulus.iter().map(|s| seq.on_sample(s)).collect();

        assert_eq!(
            requests,
            vec![
                Some(Command::RequestSubFrame(SubFrame::Magnetic)),
                Some(Command::RequestSubFrame(SubFrame::Quaternion)),
                Some(Command::RequestSubFrame(SubFrame::Temperature)),
                None,
                Some(Command::RequestSubFrame(SubFrame::Magnetic)),
                Some(Command::RequestSubFrame(SubFrame::Quaternion)),
            ]
        );
    }

    #[test]
    fn test_cycle_tracking() {
        let mut seq = PollingSequencer::new();
        assert_eq!(seq.cycle(), PollingCycle::AwaitInertial);
        seq.on_sample(&inertial());
        assert_eq!(seq.cycle(), PollingCycle::AwaitMagnetic);
        seq.on_sample(&magnetic());
        assert_eq!(seq.cycle(), PollingCycle::AwaitQuaternion);
        seq.on_sample(&quaternion());
        assert_eq!(seq.cycle(), PollingCycle::AwaitTemperature);
        seq.on_sample(&temperature());
        assert_eq!(seq.cycle(), PollingCycle::AwaitInertial);
    }

    #[test]
    fn test_unknown_sample_is_ignored() {
        let mut seq = PollingSequencer::new();
        seq.on_sample(&inertial());
        let unknown = SensorSample::Unknown {
            flag: 0x71,
            sub_flag: Some(0x68),
        };
        assert_eq!(seq.on_sample(&unknown), None);
        assert_eq!(seq.cycle(), PollingCycle::AwaitMagnetic);
    }

    #[test]
    fn test_inertial_push_restarts_cycle() {
        // A lost temperature reply must not stall polling
        let mut seq = PollingSequencer::new();
        seq.on_sample(&inertial());
        seq.on_sample(&magnetic());
        assert_eq!(
            seq.on_sample(&inertial()),
            Some(Command::RequestSubFrame(SubFrame::Magnetic))
        );
        seq.reset();
        assert_eq!(seq.cycle(), PollingCycle::AwaitInertial);
    }
}
