//! Physical explain: renders a [`DispatchablePlan`] as an ASCII tree where
//! every line carries the stage, server and worker that executes it.
//!
//! Line format:
//! `PREFIX[STAGE_ID]@HOSTNAME:PORT|[WORKER_ID] OPERATOR`
//!
//! Mailbox sends append their destinations as
//! `->{[RECEIVER_STAGE_ID]@HOSTNAME:MAILBOX_PORT|[WORKER_ID],...}`.
//!
//! A mailbox receive expands only the last of its producer workers (in
//! server-then-worker order); every other producer worker gets a single
//! `(Subtree Omitted)` send line. This keeps output size linear in the
//! number of workers instead of their product.

use msq_common::{MsqError, Result, WorkerId};
use msq_planner::{
    AggregateNode, ExplainedNode, FilterNode, JoinNode, MailboxReceiveNode, MailboxSendNode,
    PlanNode, PlanNodeVisitor, ProjectNode, SetOpNode, SortNode, TableScanNode, ValueNode,
    WindowNode,
};
use tracing::debug;

use crate::dispatchable::DispatchablePlan;
use crate::routing::ServerInstance;

const BRANCH: &str = "├── ";
const BRANCH_CONTINUATION: &str = "│   ";
const LEAF: &str = "└── ";
const LEAF_CONTINUATION: &str = "    ";

/// Explains the whole plan from the root stage's only worker.
///
/// An empty plan renders as `EMPTY`.
pub fn explain(plan: &DispatchablePlan) -> Result<String> {
    if plan.is_empty() {
        return Ok("EMPTY".to_string());
    }
    let root = plan.root_stage()?;
    let (server, worker_id) = root
        .assignment
        .destinations()
        .first()
        .copied()
        .ok_or_else(|| {
            MsqError::StructuralInconsistency(format!(
                "root stage {} has no worker",
                plan.root_stage_id()
            ))
        })?;
    explain_from_worker(plan, &root.stage.root, server, worker_id)
}

/// Explains the subtree at `node` as executed on `root_server`, using the
/// last worker that server runs for the node's stage, the same worker a
/// mailbox receive expands. Useful for printing what a single server is
/// about to execute.
pub fn explain_from(
    plan: &DispatchablePlan,
    node: &PlanNode,
    root_server: &ServerInstance,
) -> Result<String> {
    let stage = plan.stage(node.stage_id)?;
    let worker_id = stage
        .assignment
        .workers_on(root_server)
        .and_then(|workers| workers.last().copied())
        .ok_or_else(|| {
            MsqError::StructuralInconsistency(format!(
                "server {root_server} runs no worker of stage {}",
                node.stage_id
            ))
        })?;
    explain_from_worker(plan, node, root_server, worker_id)
}

/// Explains the subtree at `node` as executed by `worker_id` on `server`.
pub fn explain_from_worker(
    plan: &DispatchablePlan,
    node: &PlanNode,
    server: &ServerInstance,
    worker_id: WorkerId,
) -> Result<String> {
    debug!(
        stage_id = %node.stage_id,
        node_id = %node.id,
        server = %server,
        worker_id = %worker_id,
        operator = "PhysicalExplain",
        "explaining plan"
    );
    let mut out = String::new();
    let explainer = PhysicalExplainer { plan };
    node.visit(&explainer, ExplainContext::new(server, worker_id, &mut out))?;
    Ok(out)
}

/// Traversal state. `out` is the single accumulator, reborrowed by every
/// child context and never shared between siblings.
struct ExplainContext<'p, 'o> {
    server: &'p ServerInstance,
    worker_id: WorkerId,
    prefix: String,
    child_prefix: String,
    out: &'o mut String,
}

impl<'p> ExplainContext<'p, '_> {
    fn new<'o>(
        server: &'p ServerInstance,
        worker_id: WorkerId,
        out: &'o mut String,
    ) -> ExplainContext<'p, 'o> {
        ExplainContext {
            server,
            worker_id,
            prefix: String::new(),
            child_prefix: String::new(),
            out,
        }
    }

    /// Context for a child line, optionally running on another worker.
    fn next(
        &mut self,
        has_more_children: bool,
        server: &'p ServerInstance,
        worker_id: WorkerId,
    ) -> ExplainContext<'p, '_> {
        let (marker, continuation) = if has_more_children {
            (BRANCH, BRANCH_CONTINUATION)
        } else {
            (LEAF, LEAF_CONTINUATION)
        };
        ExplainContext {
            server,
            worker_id,
            prefix: format!("{}{marker}", self.child_prefix),
            child_prefix: format!("{}{continuation}", self.child_prefix),
            out: &mut *self.out,
        }
    }

    /// Context for a child line on the same worker.
    fn child(&mut self, has_more_children: bool) -> ExplainContext<'p, '_> {
        let (server, worker_id) = (self.server, self.worker_id);
        self.next(has_more_children, server, worker_id)
    }
}

struct PhysicalExplainer<'p> {
    plan: &'p DispatchablePlan,
}

impl<'p> PhysicalExplainer<'p> {
    fn append_info(&self, node: &PlanNode, ctx: &mut ExplainContext<'p, '_>) {
        ctx.out.push_str(&format!(
            "{}[{}]@{}:{}|[{}] {}",
            ctx.prefix,
            node.stage_id,
            ctx.server.hostname,
            ctx.server.query_service_port,
            ctx.worker_id,
            node.explain()
        ));
    }

    /// Send line without trailing newline:
    /// `...MAIL_SEND(..)->{[receiver]@endpoint,...}`.
    fn append_mailbox_send(
        &self,
        node: &PlanNode,
        send: &MailboxSendNode,
        ctx: &mut ExplainContext<'p, '_>,
    ) -> Result<()> {
        let stage = self.plan.stage(node.stage_id)?;
        let mut receivers = Vec::new();
        for &receiver in &send.receiver_stage_ids {
            let mut endpoints = stage.send_mailboxes(ctx.worker_id, receiver)?.to_vec();
            endpoints.sort();
            receivers.extend(endpoints.iter().map(|e| format!("[{receiver}]@{e}")));
        }
        self.append_info(node, ctx);
        ctx.out.push_str(&format!("->{{{}}}", receivers.join(",")));
        Ok(())
    }

    fn visit_single_input(&self, node: &PlanNode, mut ctx: ExplainContext<'p, '_>) -> Result<()> {
        let input = node.single_input()?;
        self.append_info(node, &mut ctx);
        ctx.out.push('\n');
        input.visit(self, ctx.child(false))
    }

    fn visit_leaf(&self, node: &PlanNode, mut ctx: ExplainContext<'p, '_>) -> Result<()> {
        self.append_info(node, &mut ctx);
        ctx.out.push('\n');
        Ok(())
    }
}

impl<'p, 'o> PlanNodeVisitor<ExplainContext<'p, 'o>> for PhysicalExplainer<'p> {
    type Output = ();

    fn visit_table_scan(
        &self,
        node: &PlanNode,
        _: &TableScanNode,
        mut ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        let stage = self.plan.stage(node.stage_id)?;
        let segments = stage
            .assignment
            .segments_of(ctx.worker_id)
            .map(|segments| {
                segments
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        self.append_info(node, &mut ctx);
        ctx.out.push_str(&format!(" [{segments}]\n"));
        Ok(())
    }

    fn visit_value(&self, node: &PlanNode, _: &ValueNode, ctx: ExplainContext<'p, 'o>) -> Result<()> {
        self.visit_leaf(node, ctx)
    }

    fn visit_filter(
        &self,
        node: &PlanNode,
        _: &FilterNode,
        ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        self.visit_single_input(node, ctx)
    }

    fn visit_project(
        &self,
        node: &PlanNode,
        _: &ProjectNode,
        ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        self.visit_single_input(node, ctx)
    }

    fn visit_aggregate(
        &self,
        node: &PlanNode,
        _: &AggregateNode,
        ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        self.visit_single_input(node, ctx)
    }

    fn visit_window(
        &self,
        node: &PlanNode,
        _: &WindowNode,
        ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        self.visit_single_input(node, ctx)
    }

    fn visit_sort(&self, node: &PlanNode, _: &SortNode, ctx: ExplainContext<'p, 'o>) -> Result<()> {
        self.visit_single_input(node, ctx)
    }

    fn visit_set_op(
        &self,
        node: &PlanNode,
        _: &SetOpNode,
        mut ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        node.check_arity()?;
        self.append_info(node, &mut ctx);
        ctx.out.push('\n');
        let len = node.inputs.len();
        for (idx, input) in node.inputs.iter().enumerate() {
            input.visit(self, ctx.child(idx + 1 < len))?;
        }
        Ok(())
    }

    fn visit_join(&self, node: &PlanNode, _: &JoinNode, mut ctx: ExplainContext<'p, 'o>) -> Result<()> {
        node.check_arity()?;
        self.append_info(node, &mut ctx);
        ctx.out.push('\n');
        node.inputs[0].visit(self, ctx.child(true))?;
        node.inputs[1].visit(self, ctx.child(false))
    }

    fn visit_mailbox_send(
        &self,
        node: &PlanNode,
        send: &MailboxSendNode,
        mut ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        let input = node.single_input()?;
        self.append_mailbox_send(node, send, &mut ctx)?;
        ctx.out.push('\n');
        input.visit(self, ctx.child(false))
    }

    fn visit_mailbox_receive(
        &self,
        node: &PlanNode,
        receive: &MailboxReceiveNode,
        mut ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        let plan = self.plan;
        let (sender, send) = plan.sender_of(receive, node.stage_id)?;
        let destinations = plan.stage(receive.sender_stage_id)?.assignment.destinations();
        if destinations.is_empty() {
            return Err(MsqError::StructuralInconsistency(format!(
                "sender stage {} of mailbox receive {} has no workers",
                receive.sender_stage_id, node.id
            )));
        }

        self.append_info(node, &mut ctx);
        ctx.out.push('\n');
        let last = destinations.len() - 1;
        for (idx, &(server, worker_id)) in destinations.iter().enumerate() {
            if idx == last {
                sender.visit(self, ctx.next(false, server, worker_id))?;
            } else {
                let mut omitted = ctx.next(true, server, worker_id);
                self.append_mailbox_send(sender, send, &mut omitted)?;
                omitted.out.push_str(" (Subtree Omitted)\n");
            }
        }
        Ok(())
    }

    fn visit_explained(
        &self,
        node: &PlanNode,
        _: &ExplainedNode,
        ctx: ExplainContext<'p, 'o>,
    ) -> Result<()> {
        self.visit_leaf(node, ctx)
    }
}
