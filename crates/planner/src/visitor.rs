//! Per-variant visitation over [`PlanNode`] trees.
//!
//! Behaviors (explain, validation, dispatch) implement [`PlanNodeVisitor`]
//! instead of adding methods to the node types. Each handler receives the
//! node, its typed payload and a caller-defined context `C`; recursion is up
//! to the handler.

use msq_common::{MsqError, Result};

use crate::plan_node::{
    AggregateNode, ExchangeNode, ExplainedNode, FilterNode, JoinNode, MailboxReceiveNode,
    MailboxSendNode, NodeKind, PlanNode, ProjectNode, SetOpNode, SortNode, TableScanNode,
    ValueNode, WindowNode,
};

pub trait PlanNodeVisitor<C> {
    type Output;

    fn visit_table_scan(
        &self,
        node: &PlanNode,
        scan: &TableScanNode,
        ctx: C,
    ) -> Result<Self::Output>;
    fn visit_value(&self, node: &PlanNode, value: &ValueNode, ctx: C) -> Result<Self::Output>;
    fn visit_filter(&self, node: &PlanNode, filter: &FilterNode, ctx: C) -> Result<Self::Output>;
    fn visit_project(
        &self,
        node: &PlanNode,
        project: &ProjectNode,
        ctx: C,
    ) -> Result<Self::Output>;
    fn visit_aggregate(
        &self,
        node: &PlanNode,
        aggregate: &AggregateNode,
        ctx: C,
    ) -> Result<Self::Output>;
    fn visit_window(&self, node: &PlanNode, window: &WindowNode, ctx: C) -> Result<Self::Output>;
    fn visit_sort(&self, node: &PlanNode, sort: &SortNode, ctx: C) -> Result<Self::Output>;
    fn visit_set_op(&self, node: &PlanNode, set_op: &SetOpNode, ctx: C) -> Result<Self::Output>;
    fn visit_join(&self, node: &PlanNode, join: &JoinNode, ctx: C) -> Result<Self::Output>;
    fn visit_mailbox_send(
        &self,
        node: &PlanNode,
        send: &MailboxSendNode,
        ctx: C,
    ) -> Result<Self::Output>;
    fn visit_mailbox_receive(
        &self,
        node: &PlanNode,
        receive: &MailboxReceiveNode,
        ctx: C,
    ) -> Result<Self::Output>;
    fn visit_explained(
        &self,
        node: &PlanNode,
        explained: &ExplainedNode,
        ctx: C,
    ) -> Result<Self::Output>;

    /// Exchanges are replaced by mailbox pairs during fragmentation; reaching
    /// one here means the traversal has no send/receive context to expand it.
    fn visit_exchange(
        &self,
        node: &PlanNode,
        _exchange: &ExchangeNode,
        _ctx: C,
    ) -> Result<Self::Output> {
        Err(MsqError::UnsupportedTraversal(format!(
            "exchange node {} in stage {} must not be visited outside a mailbox send/receive pair",
            node.id, node.stage_id
        )))
    }
}

impl PlanNode {
    /// Dispatches to the visitor handler for this node's variant.
    pub fn visit<C, V>(&self, visitor: &V, ctx: C) -> Result<V::Output>
    where
        V: PlanNodeVisitor<C> + ?Sized,
    {
        match &self.kind {
            NodeKind::TableScan(x) => visitor.visit_table_scan(self, x, ctx),
            NodeKind::Value(x) => visitor.visit_value(self, x, ctx),
            NodeKind::Filter(x) => visitor.visit_filter(self, x, ctx),
            NodeKind::Project(x) => visitor.visit_project(self, x, ctx),
            NodeKind::Aggregate(x) => visitor.visit_aggregate(self, x, ctx),
            NodeKind::Window(x) => visitor.visit_window(self, x, ctx),
            NodeKind::Sort(x) => visitor.visit_sort(self, x, ctx),
            NodeKind::SetOp(x) => visitor.visit_set_op(self, x, ctx),
            NodeKind::Join(x) => visitor.visit_join(self, x, ctx),
            NodeKind::MailboxSend(x) => visitor.visit_mailbox_send(self, x, ctx),
            NodeKind::MailboxReceive(x) => visitor.visit_mailbox_receive(self, x, ctx),
            NodeKind::Explained(x) => visitor.visit_explained(self, x, ctx),
            NodeKind::Exchange(x) => visitor.visit_exchange(self, x, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_node::{DistributionType, JoinType};

    /// Counts nodes within one stage; stops at mailbox boundaries.
    struct NodeCounter;

    impl NodeCounter {
        fn inputs(&self, node: &PlanNode) -> Result<usize> {
            let mut n = 1;
            for input in &node.inputs {
                n += input.visit(self, ())?;
            }
            Ok(n)
        }
    }

    impl PlanNodeVisitor<()> for NodeCounter {
        type Output = usize;

        fn visit_table_scan(&self, _: &PlanNode, _: &TableScanNode, _: ()) -> Result<usize> {
            Ok(1)
        }
        fn visit_value(&self, _: &PlanNode, _: &ValueNode, _: ()) -> Result<usize> {
            Ok(1)
        }
        fn visit_filter(&self, node: &PlanNode, _: &FilterNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_project(&self, node: &PlanNode, _: &ProjectNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_aggregate(&self, node: &PlanNode, _: &AggregateNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_window(&self, node: &PlanNode, _: &WindowNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_sort(&self, node: &PlanNode, _: &SortNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_set_op(&self, node: &PlanNode, _: &SetOpNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_join(&self, node: &PlanNode, _: &JoinNode, _: ()) -> Result<usize> {
            self.inputs(node)
        }
        fn visit_mailbox_send(&self, _: &PlanNode, _: &MailboxSendNode, _: ()) -> Result<usize> {
            Ok(1)
        }
        fn visit_mailbox_receive(
            &self,
            _: &PlanNode,
            _: &MailboxReceiveNode,
            _: (),
        ) -> Result<usize> {
            Ok(1)
        }
        fn visit_explained(&self, _: &PlanNode, _: &ExplainedNode, _: ()) -> Result<usize> {
            Ok(1)
        }
    }

    #[test]
    fn dispatches_per_variant() {
        let plan = PlanNode::join(
            JoinType::Inner,
            &[("k", "k")],
            PlanNode::filter("v > 0", PlanNode::table_scan("a", &["k", "v"])),
            PlanNode::value(vec![vec!["1".to_string()]]),
        );
        assert_eq!(plan.visit(&NodeCounter, ()).unwrap(), 4);
    }

    #[test]
    fn lone_exchange_fails_fast() {
        let exchange = PlanNode::exchange(
            DistributionType::Hash,
            &["k"],
            PlanNode::table_scan("a", &["k"]),
        );
        let err = exchange.visit(&NodeCounter, ()).unwrap_err();
        assert!(matches!(err, MsqError::UnsupportedTraversal(_)));

        let nested = PlanNode::project(&["k"], exchange);
        assert!(matches!(
            nested.visit(&NodeCounter, ()),
            Err(MsqError::UnsupportedTraversal(_))
        ));
    }
}
