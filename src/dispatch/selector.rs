//! Host selection strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::host::Host;

/// Picks one host out of the live candidates, or none when there are none
pub trait HostSelector: Send + Sync {
    fn select(&self, hosts: &[Host]) -> Option<Host>;

    fn selector_name(&self) -> &'static str;
}

/// Cycles through the candidate list in order
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelector for RoundRobinSelector {
    fn select(&self, hosts: &[Host]) -> Option<Host> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.get(index).cloned()
    }

    fn selector_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Picks the host with the smallest weight; ties keep list order.
/// Hosts without a weight sort last.
#[derive(Debug, Default)]
pub struct LowerWeightSelector;

impl HostSelector for LowerWeightSelector {
    fn select(&self, hosts: &[Host]) -> Option<Host> {
        let mut best: Option<(&Host, f64)> = None;
        for host in hosts {
            let weight = host.weight.unwrap_or(f64::INFINITY);
            match best {
                Some((_, lowest)) if weight >= lowest => {}
                _ => best = Some((host, weight)),
            }
        }
        best.map(|(host, _)| host.clone())
    }

    fn selector_name(&self) -> &'static str {
        "lower_weight"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    RoundRobin,
    #[default]
    LowerWeight,
}

impl SelectorKind {
    pub fn build(self) -> Arc<dyn HostSelector> {
        match self {
            SelectorKind::RoundRobin => Arc::new(RoundRobinSelector::new()),
            SelectorKind::LowerWeight => Arc::new(LowerWeightSelector),
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorKind::RoundRobin => write!(f, "round_robin"),
            SelectorKind::LowerWeight => write!(f, "lower_weight"),
        }
    }
}

impl FromStr for SelectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(SelectorKind::RoundRobin),
            "lower_weight" => Ok(SelectorKind::LowerWeight),
            _ => Err(format!("Unknown host selector: {s}")),
        }
    }
}
