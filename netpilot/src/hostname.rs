//! Reverse-DNS hostname resolver
//!
//! One lookup at a time. Starting a new lookup orphans the previous one;
//! its result is still delivered by the backend but the generation no
//! longer matches and [`HostnameResolver::complete`] drops it.

use crate::scheduler::{Event, EventSink};
use crate::types::DeviceId;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Performs the actual address-to-name lookup
pub trait ReverseLookup {
    /// Resolve `address`; the result arrives as `Event::HostnameLookup`
    fn start(&mut self, generation: u64, address: IpAddr);

    fn cancel(&mut self, generation: u64);
}

/// Resolver progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupState {
    Idle,
    Pending {
        generation: u64,
        device: DeviceId,
        address: IpAddr,
    },
    Resolved(String),
    Failed,
}

/// Single-lookup-at-a-time state machine
pub struct HostnameResolver {
    state: LookupState,
    generation: u64,
    backend: Box<dyn ReverseLookup>,
}

impl HostnameResolver {
    pub fn new(backend: Box<dyn ReverseLookup>) -> Self {
        Self {
            state: LookupState::Idle,
            generation: 0,
            backend,
        }
    }

    pub fn state(&self) -> &LookupState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, LookupState::Pending { .. })
    }

    /// Begin a lookup of `address`, superseding any pending one
    pub fn start(&mut self, device: DeviceId, address: IpAddr) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        log::debug!("hostname: reverse lookup of {} (#{})", address, generation);
        self.state = LookupState::Pending {
            generation,
            device,
            address,
        };
        self.backend.start(generation, address);
        generation
    }

    /// Abandon the pending lookup, if any
    pub fn cancel(&mut self) -> bool {
        if let LookupState::Pending { generation, .. } = self.state {
            self.backend.cancel(generation);
            self.state = LookupState::Idle;
            return true;
        }
        false
    }

    /// Abandon the pending lookup if it was started for `device`
    pub fn cancel_for(&mut self, device: DeviceId) -> bool {
        match self.state {
            LookupState::Pending { device: d, .. } if d == device => self.cancel(),
            _ => false,
        }
    }

    /// Accept a backend result; `None` if it belongs to a stale lookup
    pub fn complete(&mut self, generation: u64, result: Option<String>) -> Option<Option<String>> {
        match self.state {
            LookupState::Pending { generation: g, .. } if g == generation => {}
            _ => {
                log::debug!("hostname: dropping stale lookup result #{}", generation);
                return None;
            }
        }
        self.state = match &result {
            Some(name) => LookupState::Resolved(name.clone()),
            None => LookupState::Failed,
        };
        Some(result)
    }
}

/// Resolves through `getent hosts`, honouring nsswitch
pub struct GetentLookup {
    sink: EventSink,
    tasks: HashMap<u64, JoinHandle<()>>,
}

impl GetentLookup {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            tasks: HashMap::new(),
        }
    }
}

impl ReverseLookup for GetentLookup {
    fn start(&mut self, generation: u64, address: IpAddr) {
        self.tasks.retain(|_, task| !task.is_finished());
        let sink = self.sink.clone();
        let task = tokio::task::spawn_local(async move {
            let result = match Command::new("getent")
                .args(["hosts", &address.to_string()])
                .kill_on_drop(true)
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    parse_getent(&String::from_utf8_lossy(&output.stdout))
                }
                Ok(_) => None,
                Err(e) => {
                    log::warn!("hostname: failed to run getent: {}", e);
                    None
                }
            };
            let _ = sink.send(Event::HostnameLookup { generation, result });
        });
        self.tasks.insert(generation, task);
    }

    fn cancel(&mut self, generation: u64) {
        if let Some(task) = self.tasks.remove(&generation) {
            task.abort();
        }
    }
}

/// First name from `getent hosts` output: `<address> <name> [aliases...]`
pub fn parse_getent(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        started: Rc<RefCell<Vec<(u64, IpAddr)>>>,
        cancelled: Rc<RefCell<Vec<u64>>>,
    }

    impl ReverseLookup for Recorder {
        fn start(&mut self, generation: u64, address: IpAddr) {
            self.started.borrow_mut().push((generation, address));
        }

        fn cancel(&mut self, generation: u64) {
            self.cancelled.borrow_mut().push(generation);
        }
    }

    fn resolver() -> (HostnameResolver, Rc<RefCell<Vec<u64>>>) {
        let recorder = Recorder::default();
        let cancelled = Rc::clone(&recorder.cancelled);
        (HostnameResolver::new(Box::new(recorder)), cancelled)
    }

    #[test]
    fn test_new_lookup_supersedes_old() {
        let (mut resolver, cancelled) = resolver();
        let first = resolver.start(DeviceId(1), "192.168.1.5".parse().unwrap());
        let second = resolver.start(DeviceId(1), "192.168.1.6".parse().unwrap());
        assert_eq!(*cancelled.borrow(), vec![first]);

        // Late result of the orphaned lookup is dropped
        assert_eq!(resolver.complete(first, Some("old".to_string())), None);
        assert!(resolver.is_pending());

        assert_eq!(
            resolver.complete(second, Some("box.lan".to_string())),
            Some(Some("box.lan".to_string()))
        );
        assert_eq!(resolver.state(), &LookupState::Resolved("box.lan".to_string()));
    }

    #[test]
    fn test_failure_and_cancel() {
        let (mut resolver, _) = resolver();
        let generation = resolver.start(DeviceId(2), "10.0.0.2".parse().unwrap());
        assert_eq!(resolver.complete(generation, None), Some(None));
        assert_eq!(resolver.state(), &LookupState::Failed);

        let generation = resolver.start(DeviceId(2), "10.0.0.2".parse().unwrap());
        assert!(!resolver.cancel_for(DeviceId(3)));
        assert!(resolver.cancel_for(DeviceId(2)));
        assert_eq!(resolver.complete(generation, Some("late".to_string())), None);
        assert_eq!(resolver.state(), &LookupState::Idle);
        assert!(!resolver.cancel());
    }

    #[test]
    fn test_parse_getent() {
        assert_eq!(
            parse_getent("192.168.1.5     box.lan box\n"),
            Some("box.lan".to_string())
        );
        assert_eq!(parse_getent(""), None);
        assert_eq!(parse_getent("192.168.1.5\n"), None);
    }
}
