use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use imrpc_common::Result;

use crate::picker::{candidates, Filter, PickInfo, PickResult, Picker, PickerBuilder};
use crate::registry::ServiceInstance;

/// Builds [`RoundRobinPicker`]s.
#[derive(Clone, Default)]
pub struct RoundRobinBuilder {
    filter: Option<Filter>,
}

impl RoundRobinBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl PickerBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn build(&self, instances: &[ServiceInstance]) -> Arc<dyn Picker> {
        Arc::new(RoundRobinPicker {
            instances: instances.to_vec(),
            next: AtomicU64::new(0),
            filter: self.filter.clone(),
        })
    }
}

/// Cycles through the filtered candidates in list order.
///
/// A single lock-free counter drives every pick, so the position is shared
/// across callers: with N candidates, any N consecutive picks hit each
/// candidate exactly once.
pub struct RoundRobinPicker {
    instances: Vec<ServiceInstance>,
    next: AtomicU64,
    filter: Option<Filter>,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult> {
        let candidates = candidates(&self.instances, |i| i, self.filter.as_ref(), info)?;
        let position = self.next.fetch_add(1, Ordering::Relaxed);
        let chosen = candidates[(position % candidates.len() as u64) as usize];
        debug!("round robin picked {} for {}.{}", chosen.address, info.service, info.method);
        Ok(PickResult::new(chosen.address.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::group_filter;
    use imrpc_common::ImrpcError;
    use std::collections::HashMap;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new("svc", format!("10.0.0.{}:8080", i)))
            .collect()
    }

    #[test]
    fn test_cycles_in_order() {
        let picker = RoundRobinBuilder::new().build(&instances(3));
        let info = PickInfo::default();
        let picked: Vec<String> = (0..6).map(|_| picker.pick(&info).unwrap().address).collect();
        assert_eq!(
            picked,
            vec![
                "10.0.0.0:8080",
                "10.0.0.1:8080",
                "10.0.0.2:8080",
                "10.0.0.0:8080",
                "10.0.0.1:8080",
                "10.0.0.2:8080",
            ]
        );
    }

    #[test]
    fn test_even_distribution() {
        let picker = RoundRobinBuilder::new().build(&instances(4));
        let info = PickInfo::default();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            *counts.entry(picker.pick(&info).unwrap().address).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[test]
    fn test_empty_list_has_no_candidates() {
        let picker = RoundRobinBuilder::new().build(&[]);
        assert!(matches!(
            picker.pick(&PickInfo::default()),
            Err(ImrpcError::NoCandidates)
        ));
    }

    #[test]
    fn test_group_filter_routes_to_group() {
        let list = vec![
            ServiceInstance::new("svc", "a:1").with_group("A"),
            ServiceInstance::new("svc", "b:1").with_group("B"),
            ServiceInstance::new("svc", "b:2").with_group("B"),
        ];
        let picker = RoundRobinBuilder::new().with_filter(group_filter()).build(&list);

        let to_a = PickInfo {
            group: Some("A"),
            ..PickInfo::default()
        };
        for _ in 0..10 {
            assert_eq!(picker.pick(&to_a).unwrap().address, "a:1");
        }

        let to_c = PickInfo {
            group: Some("C"),
            ..PickInfo::default()
        };
        assert!(matches!(picker.pick(&to_c), Err(ImrpcError::NoCandidates)));
    }

    #[test]
    fn test_no_done_callback() {
        let picker = RoundRobinBuilder::new().build(&instances(1));
        assert!(picker.pick(&PickInfo::default()).unwrap().done.is_none());
    }
}
