use crate::intervention_graph::Graph;
use crate::value::Value;
use std::time::Instant;

pub trait GraphObserver {
    fn on_pass_started(&mut self, _pass: usize, _release: bool) {}
    fn on_node_executed(&mut self, _name: &str, _start_instant: Instant, _end_instant: Instant) {}
    fn on_value_assigned(&mut self, _name: &str, _value: &Value) {}
    fn on_pass_finished(&mut self, _pass: usize, _graph: &Graph) {}
}

impl GraphObserver for () {}
