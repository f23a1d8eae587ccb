//! Listener materialisation. Runs twice: the first pass binds the configured
//! addresses before any routes exist; the second pass (driven from
//! `builder::build` via `finalise_listeners`) sorts routes and drops
//! listeners that gathered no virtual hosts.

use crate::dag::builder::{DagBuilderState, Processor};
use crate::k8s::CacheSnapshot;

pub enum ListenerProcessor {
    FirstPass,
}

impl Processor for ListenerProcessor {
    fn process(&mut self, _cache: &CacheSnapshot, dag: &mut DagBuilderState) {
        match self {
            ListenerProcessor::FirstPass => dag.materialise_listeners(),
        }
    }
}
