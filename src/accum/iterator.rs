use crate::accum::Accumulator;
use crate::intervention_graph::observer::GraphObserver;
use crate::intervention_graph::protocols::{IteratorItemProtocol, PassContext, Target};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ProxyValue, Value};

/// An iteration scope over a finite sequence, run one pass per item.
#[derive(Debug, Clone)]
pub struct Iterator {
    data: Vec<Value>,
    iter_idx: usize,
    item: NodeRef,
}

impl Iterator {
    pub fn enter(acc: &mut Accumulator, data: Vec<Value>) -> Result<(NodeRef, Self), GraphError> {
        let proxy_value = data.first().map(ProxyValue::of).unwrap_or_default();
        let (item, iter_idx) = IteratorItemProtocol::add(&mut acc.graph, proxy_value)?;
        log::debug!("Entered iteration scope {iter_idx} over {} items", data.len());
        Ok((
            item.clone(),
            Self {
                data,
                iter_idx,
                item,
            },
        ))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn item(&self) -> &NodeRef {
        &self.item
    }

    /// Runs one pass per item. The bridge releases on the last pass only, so accumulated
    /// values become visible once the whole sequence has been folded in.
    pub fn execute(
        &self,
        acc: &mut Accumulator,
        parents: &[&Graph],
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<(), GraphError> {
        acc.graph.compile()?;
        acc.bridge.set_release(false);
        // Running totals fold every pass even when their input does not depend on the item.
        let sums: Vec<String> = acc
            .graph
            .nodes()
            .filter(|node| node.target() == Target::IterSum)
            .map(|node| node.name().to_string())
            .collect();
        let seeds = std::iter::once(self.item.name()).chain(sums.iter().map(String::as_str));
        let scope = acc.graph.downstream_of_all(seeds)?;
        acc.graph.clear_nodes(&scope);

        let last = self.data.len().saturating_sub(1);
        for (i, item) in self.data.iter().enumerate() {
            if i == last {
                acc.bridge.set_release(true);
            }
            acc.graph.next_pass();
            acc.graph.reset_nodes(&scope);
            observer.on_pass_started(i, acc.bridge.release());

            IteratorItemProtocol::set(&mut acc.graph, item.clone(), self.iter_idx)?;
            observer.on_value_assigned(self.item.name(), item);

            let ctx = PassContext::new()
                .with_bridge(&acc.bridge)
                .with_parents(parents);
            acc.graph.execute_ready(&ctx, observer)?;
            observer.on_pass_finished(i, &acc.graph);
        }
        acc.bridge.set_release(false);
        Ok(())
    }
}
