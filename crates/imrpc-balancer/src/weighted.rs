use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use imrpc_common::Result;

use crate::picker::{candidates, DoneInfo, Filter, PickInfo, PickResult, Picker, PickerBuilder};
use crate::registry::ServiceInstance;

/// Builds [`WeightedPicker`]s from instance weights.
#[derive(Clone, Default)]
pub struct WeightedBuilder {
    filter: Option<Filter>,
}

impl WeightedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl PickerBuilder for WeightedBuilder {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn build(&self, instances: &[ServiceInstance]) -> Arc<dyn Picker> {
        let candidates = instances
            .iter()
            .map(|instance| {
                Arc::new(WeightedCandidate {
                    instance: instance.clone(),
                    state: Mutex::new(WeightState::new(instance.weight)),
                })
            })
            .collect();
        Arc::new(WeightedPicker {
            candidates,
            filter: self.filter.clone(),
        })
    }
}

#[derive(Debug)]
struct WeightState {
    /// Configured weight from the registry entry; never changes.
    weight: u32,
    current: i64,
    effective: u32,
}

impl WeightState {
    fn new(weight: u32) -> Self {
        Self {
            weight,
            current: 0,
            effective: weight,
        }
    }
}

struct WeightedCandidate {
    instance: ServiceInstance,
    state: Mutex<WeightState>,
}

impl WeightedCandidate {
    fn lock(&self) -> std::sync::MutexGuard<'_, WeightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, info: &DoneInfo<'_>) {
        let mut state = self.lock();
        state.effective = if info.succeeded() {
            state.effective.saturating_add(1)
        } else {
            state.effective.saturating_sub(1)
        };
        if state.effective != state.weight {
            debug!(
                "{} effective weight {} (configured {})",
                self.instance.address, state.effective, state.weight
            );
        }
    }
}

/// Smooth weighted round-robin.
///
/// Every pick raises each candidate's current weight by its effective weight,
/// takes the highest, and lowers the winner by the total. Call outcomes move
/// the winner's effective weight up by one on success and down by one on
/// failure, saturating at `0` and `u32::MAX`, so a failing backend is starved
/// gradually rather than removed.
///
/// Each candidate has its own lock; picks never take a picker-wide lock.
pub struct WeightedPicker {
    candidates: Vec<Arc<WeightedCandidate>>,
    filter: Option<Filter>,
}

impl Picker for WeightedPicker {
    fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult> {
        let candidates = candidates(&self.candidates, |c| &c.instance, self.filter.as_ref(), info)?;

        let mut total: i64 = 0;
        let mut best: Option<(&Arc<WeightedCandidate>, i64)> = None;
        for candidate in candidates {
            let mut state = candidate.lock();
            let effective = i64::from(state.effective);
            total += effective;
            state.current += effective;
            if best.map_or(true, |(_, current)| state.current > current) {
                best = Some((candidate, state.current));
            }
        }

        // candidates() never returns an empty list
        let Some((winner, _)) = best else {
            return Err(imrpc_common::ImrpcError::NoCandidates);
        };
        winner.lock().current -= total;

        debug!(
            "weighted picked {} for {}.{}",
            winner.instance.address, info.service, info.method
        );

        let feedback = Arc::clone(winner);
        Ok(PickResult {
            address: winner.instance.address.clone(),
            done: Some(Box::new(move |info: &DoneInfo<'_>| feedback.record(info))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::group_filter;
    use imrpc_common::ImrpcError;
    use std::collections::HashMap;

    fn picker_over(weights: &[u32]) -> (Arc<dyn Picker>, Vec<String>) {
        let instances: Vec<ServiceInstance> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| ServiceInstance::new("svc", format!("node-{}", i)).with_weight(*w))
            .collect();
        let addresses = instances.iter().map(|i| i.address.clone()).collect();
        (WeightedBuilder::new().build(&instances), addresses)
    }

    fn effective_weights(picker: &WeightedPicker) -> Vec<u32> {
        picker.candidates.iter().map(|c| c.lock().effective).collect()
    }

    #[test]
    fn test_smooth_sequence() {
        let (picker, addresses) = picker_over(&[5, 1, 1]);
        let info = PickInfo::default();
        let picked: Vec<usize> = (0..7)
            .map(|_| {
                let address = picker.pick(&info).unwrap().address;
                addresses.iter().position(|a| *a == address).unwrap()
            })
            .collect();

        // Heavy node interleaved with the light ones, not served in a block
        assert_eq!(picked, vec![0, 0, 1, 0, 2, 0, 0]);
    }

    #[test]
    fn test_distribution_follows_weights() {
        let instances = vec![
            ServiceInstance::new("svc", "heavy").with_weight(3),
            ServiceInstance::new("svc", "light").with_weight(1),
        ];
        let picker = WeightedBuilder::new().build(&instances);
        let info = PickInfo::default();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            // Outcomes not reported: weights stay fixed
            *counts.entry(picker.pick(&info).unwrap().address).or_default() += 1;
        }
        assert_eq!(counts["heavy"], 300);
        assert_eq!(counts["light"], 100);
    }

    #[test]
    fn test_failures_reduce_effective_weight_to_floor() {
        let instances = vec![ServiceInstance::new("svc", "flaky").with_weight(3)];
        let picker = WeightedPicker {
            candidates: vec![Arc::new(WeightedCandidate {
                instance: instances[0].clone(),
                state: Mutex::new(WeightState::new(3)),
            })],
            filter: None,
        };
        let info = PickInfo::default();
        let failure = ImrpcError::Connection("refused".into());

        let mut previous = effective_weights(&picker)[0];
        for _ in 0..3 {
            picker.pick(&info).unwrap().finish(Some(&failure));
            let now = effective_weights(&picker)[0];
            assert!(now < previous);
            previous = now;
        }
        assert_eq!(previous, 0);

        // Saturates at zero
        picker.pick(&info).unwrap().finish(Some(&failure));
        assert_eq!(effective_weights(&picker)[0], 0);
    }

    #[test]
    fn test_success_saturates_at_max() {
        let instance = ServiceInstance::new("svc", "solid").with_weight(u32::MAX);
        let candidate = WeightedCandidate {
            instance,
            state: Mutex::new(WeightState::new(u32::MAX)),
        };
        candidate.record(&DoneInfo { error: None });
        assert_eq!(candidate.lock().effective, u32::MAX);
    }

    #[test]
    fn test_configured_weight_survives_feedback() {
        let instances = vec![ServiceInstance::new("svc", "node").with_weight(4)];
        let picker = WeightedPicker {
            candidates: vec![Arc::new(WeightedCandidate {
                instance: instances[0].clone(),
                state: Mutex::new(WeightState::new(instances[0].weight)),
            })],
            filter: None,
        };
        let info = PickInfo::default();
        let failure = ImrpcError::Connection("reset".into());

        picker.pick(&info).unwrap().finish(Some(&failure));
        picker.pick(&info).unwrap().finish(Some(&failure));
        picker.pick(&info).unwrap().finish(None);
        {
            let state = picker.candidates[0].lock();
            assert_eq!(state.weight, 4);
            assert_eq!(state.effective, 3);
        }

        for _ in 0..5 {
            picker.pick(&info).unwrap().finish(None);
        }
        let state = picker.candidates[0].lock();
        assert_eq!(state.weight, 4);
        assert_eq!(state.effective, 8);
    }

    #[test]
    fn test_failing_node_gets_fewer_picks() {
        let (picker, addresses) = picker_over(&[10, 10]);
        let info = PickInfo::default();
        let failure = ImrpcError::Connection("reset".into());
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..2000 {
            let result = picker.pick(&info).unwrap();
            let address = result.address.clone();
            if address == addresses[1] {
                result.finish(Some(&failure));
            } else {
                result.finish(None);
            }
            *counts.entry(address).or_default() += 1;
        }

        let healthy = counts.get(&addresses[0]).copied().unwrap_or(0);
        let failing = counts.get(&addresses[1]).copied().unwrap_or(0);
        assert!(failing <= healthy, "failing {} vs healthy {}", failing, healthy);
        assert!(failing < 100);
    }

    #[test]
    fn test_filter_and_no_candidates() {
        let instances = vec![
            ServiceInstance::new("svc", "a").with_group("A").with_weight(1),
            ServiceInstance::new("svc", "b").with_group("B").with_weight(100),
        ];
        let picker = WeightedBuilder::new().with_filter(group_filter()).build(&instances);

        let to_a = PickInfo {
            group: Some("A"),
            ..PickInfo::default()
        };
        for _ in 0..5 {
            assert_eq!(picker.pick(&to_a).unwrap().address, "a");
        }

        let to_c = PickInfo {
            group: Some("C"),
            ..PickInfo::default()
        };
        assert!(matches!(picker.pick(&to_c), Err(ImrpcError::NoCandidates)));
        assert!(matches!(
            WeightedBuilder::new().build(&[]).pick(&PickInfo::default()),
            Err(ImrpcError::NoCandidates)
        ));
    }
}
