use crate::plan_node::{NodeKind, PlanNode};

impl PlanNode {
    /// Operator text for one node, without stage/worker context.
    pub fn explain(&self) -> String {
        match &self.kind {
            NodeKind::TableScan(scan) => format!("TABLE SCAN ({})", scan.table),
            NodeKind::Value(_) => "LITERAL".to_string(),
            NodeKind::Filter(_) => "FILTER".to_string(),
            NodeKind::Project(_) => "PROJECT".to_string(),
            NodeKind::Aggregate(agg) => format!("AGGREGATE_{}", agg.agg_type),
            NodeKind::Window(_) => "WINDOW".to_string(),
            NodeKind::Sort(sort) => match (sort.fetch, sort.offset) {
                (None, None) => "SORT".to_string(),
                (Some(fetch), None) => format!("SORT LIMIT {fetch}"),
                (None, Some(offset)) => format!("SORT OFFSET {offset}"),
                (Some(fetch), Some(offset)) => format!("SORT LIMIT {fetch} OFFSET {offset}"),
            },
            NodeKind::SetOp(set_op) => {
                if set_op.all {
                    format!("{} ALL", set_op.set_op_type)
                } else {
                    set_op.set_op_type.to_string()
                }
            }
            NodeKind::Join(join) => format!("JOIN({})", join.join_type),
            NodeKind::MailboxSend(send) => format!("MAIL_SEND({})", send.distribution),
            NodeKind::MailboxReceive(receive) => format!("MAIL_RECEIVE({})", receive.distribution),
            NodeKind::Explained(explained) => {
                if explained.attributes.is_empty() {
                    explained.title.clone()
                } else {
                    let attrs = explained
                        .attributes
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{}({attrs})", explained.title)
                }
            }
            NodeKind::Exchange(exchange) => format!("EXCHANGE({})", exchange.distribution),
        }
    }
}

/// Render one stage-local tree as human-readable multiline text, with
/// operator config. Mailbox receives are not expanded.
pub fn explain_tree(plan: &PlanNode) -> String {
    let mut s = String::new();
    fmt_node(plan, 0, &mut s);
    s
}

fn fmt_node(node: &PlanNode, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{pad}{}", node.explain()));
    match &node.kind {
        NodeKind::TableScan(scan) => {
            out.push_str(&format!(" columns={:?}\n", scan.columns));
        }
        NodeKind::Value(value) => {
            out.push_str(&format!(" rows={}\n", value.rows.len()));
        }
        NodeKind::Filter(filter) => {
            out.push_str(&format!(" {}\n", filter.condition));
        }
        NodeKind::Project(project) => {
            out.push('\n');
            for p in &project.projects {
                out.push_str(&format!("{pad}  {p}\n"));
            }
        }
        NodeKind::Aggregate(agg) => {
            out.push('\n');
            out.push_str(&format!("{pad}  group_by={:?}\n", agg.group_keys));
            out.push_str(&format!("{pad}  aggs={:?}\n", agg.agg_calls));
        }
        NodeKind::Window(window) => {
            out.push('\n');
            out.push_str(&format!("{pad}  partition_by={:?}\n", window.partition_keys));
            out.push_str(&format!("{pad}  order_by={:?}\n", window.order_keys));
            out.push_str(&format!("{pad}  aggs={:?}\n", window.agg_calls));
        }
        NodeKind::Sort(sort) => {
            out.push_str(&format!(" by={:?}\n", sort.collations));
        }
        NodeKind::Join(join) => {
            out.push_str(&format!(" on={:?}\n", join.on));
        }
        NodeKind::MailboxSend(send) => {
            let receivers = send
                .receiver_stage_ids
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!(" keys={:?} to=[{receivers}]\n", send.keys));
        }
        NodeKind::MailboxReceive(receive) => {
            out.push_str(&format!(" from={}\n", receive.sender_stage_id));
        }
        NodeKind::Exchange(exchange) => {
            out.push_str(&format!(" keys={:?}\n", exchange.keys));
        }
        NodeKind::SetOp(_) | NodeKind::Explained(_) => out.push('\n'),
    }
    for input in &node.inputs {
        fmt_node(input, indent + 1, out);
    }
}
