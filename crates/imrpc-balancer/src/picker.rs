use std::fmt;
use std::sync::Arc;

use imrpc_common::{ImrpcError, Result};

use crate::registry::ServiceInstance;

/// What the caller knows about the call being routed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickInfo<'a> {
    pub service: &'a str,
    pub method: &'a str,
    /// Routing group requested by the caller, if any
    pub group: Option<&'a str>,
}

/// Outcome of a finished call, fed back to the picker that routed it.
#[derive(Debug, Clone, Copy)]
pub struct DoneInfo<'a> {
    pub error: Option<&'a ImrpcError>,
}

impl DoneInfo<'_> {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Completion hook returned with a pick.
pub type DoneCallback = Box<dyn FnOnce(&DoneInfo<'_>) + Send>;

/// The address chosen for one call.
pub struct PickResult {
    pub address: String,
    pub done: Option<DoneCallback>,
}

impl PickResult {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            done: None,
        }
    }

    /// Reports the call outcome, if the picker asked for it.
    pub fn finish(self, error: Option<&ImrpcError>) {
        if let Some(done) = self.done {
            done(&DoneInfo { error });
        }
    }
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("address", &self.address)
            .field("done", &self.done.is_some())
            .finish()
    }
}

/// Chooses one instance per call from a fixed candidate set.
///
/// A picker is built once per resolved instance list and replaced wholesale
/// when the list changes.
pub trait Picker: Send + Sync {
    /// Fails with [`ImrpcError::NoCandidates`] when filtering leaves nothing.
    fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult>;
}

/// Builds a [`Picker`] over a resolved instance list.
pub trait PickerBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, instances: &[ServiceInstance]) -> Arc<dyn Picker>;
}

/// Candidate predicate: `true` keeps the instance for this pick.
pub type Filter = Arc<dyn Fn(&PickInfo<'_>, &ServiceInstance) -> bool + Send + Sync>;

/// Keeps instances whose group equals the caller's group.
///
/// Calls without a group may go to any instance.
pub fn group_filter() -> Filter {
    Arc::new(|info: &PickInfo<'_>, instance: &ServiceInstance| match info.group {
        Some(group) => instance.group == group,
        None => true,
    })
}

/// Applies `filter` to `instances`, failing if nothing survives.
pub(crate) fn candidates<'a, T, F>(
    items: &'a [T],
    instance: F,
    filter: Option<&Filter>,
    info: &PickInfo<'_>,
) -> Result<Vec<&'a T>>
where
    F: Fn(&T) -> &ServiceInstance,
{
    let kept: Vec<&T> = match filter {
        Some(filter) => items.iter().filter(|item| filter(info, instance(*item))).collect(),
        None => items.iter().collect(),
    };
    if kept.is_empty() {
        return Err(ImrpcError::NoCandidates);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_group_filter() {
        let filter = group_filter();
        let a = ServiceInstance::new("svc", "a:1").with_group("A");
        let b = ServiceInstance::new("svc", "b:1").with_group("B");

        let to_a = PickInfo {
            group: Some("A"),
            ..PickInfo::default()
        };
        assert!(filter(&to_a, &a));
        assert!(!filter(&to_a, &b));

        let anywhere = PickInfo::default();
        assert!(filter(&anywhere, &a));
        assert!(filter(&anywhere, &b));
    }

    #[test]
    fn test_candidates_empty_after_filter() {
        let instances = vec![ServiceInstance::new("svc", "a:1").with_group("A")];
        let filter = group_filter();
        let info = PickInfo {
            group: Some("C"),
            ..PickInfo::default()
        };
        let result = candidates(&instances, |i| i, Some(&filter), &info);
        assert!(matches!(result, Err(ImrpcError::NoCandidates)));
    }

    #[test]
    fn test_finish_runs_done_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let mut result = PickResult::new("a:1");
        result.done = Some(Box::new(move |info: &DoneInfo<'_>| {
            assert!(!info.succeeded());
            flag.store(true, Ordering::SeqCst);
        }));

        result.finish(Some(&ImrpcError::Cancelled));
        assert!(called.load(Ordering::SeqCst));
    }
}
