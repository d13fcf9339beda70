use std::collections::BTreeMap;
use std::fmt;

use msq_common::{MsqError, PlanNodeId, Result, StageId};
use serde::{Deserialize, Serialize};

/// One operator in a stage's plan tree.
///
/// `id` and `stage_id` are assigned by stage fragmentation; nodes built with
/// the constructors below start at `0/0`. `inputs` are owned and ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Node id, unique within the query after fragmentation.
    pub id: PlanNodeId,
    /// Stage this node executes in.
    pub stage_id: StageId,
    /// Operator variant and its config.
    pub kind: NodeKind,
    /// Ordered inputs.
    pub inputs: Vec<PlanNode>,
}

/// Operator variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Table scan (leaf).
    TableScan(TableScanNode),
    /// Inline literal rows (leaf).
    Value(ValueNode),
    /// Row filter.
    Filter(FilterNode),
    /// Projection.
    Project(ProjectNode),
    /// Aggregation (any phase).
    Aggregate(AggregateNode),
    /// Window functions.
    Window(WindowNode),
    /// Sort with optional limit/offset.
    Sort(SortNode),
    /// N-ary set operation.
    SetOp(SetOpNode),
    /// Binary join.
    Join(JoinNode),
    /// Producer side of a stage boundary; root of the producer stage.
    MailboxSend(MailboxSendNode),
    /// Consumer side of a stage boundary; leaf of the consumer stage.
    MailboxReceive(MailboxReceiveNode),
    /// Leaf whose explain text was produced elsewhere (e.g. by a server-side planner).
    Explained(ExplainedNode),
    /// Unfragmented exchange marker. Only valid before stage fragmentation.
    Exchange(ExchangeNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableScanNode {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNode {
    /// Literal rows, each value pre-rendered.
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterNode {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectNode {
    pub projects: Vec<String>,
}

/// Phase of a (possibly split) aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggType {
    /// Single-phase aggregate.
    Direct,
    /// First phase, runs next to the scan.
    Leaf,
    /// Merges partial states without finalizing.
    Intermediate,
    /// Final merge producing result values.
    Final,
}

impl fmt::Display for AggType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggType::Direct => "DIRECT",
            AggType::Leaf => "LEAF",
            AggType::Intermediate => "INTERMEDIATE",
            AggType::Final => "FINAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateNode {
    pub group_keys: Vec<String>,
    pub agg_calls: Vec<String>,
    pub agg_type: AggType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowNode {
    pub partition_keys: Vec<String>,
    pub order_keys: Vec<String>,
    pub agg_calls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortNode {
    pub collations: Vec<String>,
    pub fetch: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOpType {
    Union,
    Intersect,
    Minus,
}

impl fmt::Display for SetOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetOpType::Union => "UNION",
            SetOpType::Intersect => "INTERSECT",
            SetOpType::Minus => "MINUS",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOpNode {
    pub set_op_type: SetOpType,
    pub all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::Semi => "SEMI",
            JoinType::Anti => "ANTI",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinNode {
    pub join_type: JoinType,
    /// Equi-join key pairs `(left_key, right_key)`.
    pub on: Vec<(String, String)>,
}

/// How rows are routed from producer workers to consumer workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionType {
    /// Everything goes to the single consumer worker.
    Singleton,
    /// Partitioned by hash of the distribution keys.
    Hash,
    /// Any consumer worker.
    Random,
    /// Every consumer worker gets every row.
    Broadcast,
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistributionType::Singleton => "SINGLETON",
            DistributionType::Hash => "HASH_DISTRIBUTED",
            DistributionType::Random => "RANDOM_DISTRIBUTED",
            DistributionType::Broadcast => "BROADCAST_DISTRIBUTED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxSendNode {
    /// Stages fed by this sender, ascending.
    pub receiver_stage_ids: Vec<StageId>,
    pub distribution: DistributionType,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxReceiveNode {
    /// Stage whose root is the matching [`MailboxSendNode`].
    pub sender_stage_id: StageId,
    pub distribution: DistributionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainedNode {
    pub title: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeNode {
    pub distribution: DistributionType,
    pub keys: Vec<String>,
}

impl PlanNode {
    pub fn new(kind: NodeKind, inputs: Vec<PlanNode>) -> Self {
        Self {
            id: PlanNodeId(0),
            stage_id: StageId(0),
            kind,
            inputs,
        }
    }

    pub fn table_scan(table: &str, columns: &[&str]) -> Self {
        Self::new(
            NodeKind::TableScan(TableScanNode {
                table: table.to_string(),
                columns: to_strings(columns),
            }),
            vec![],
        )
    }

    pub fn value(rows: Vec<Vec<String>>) -> Self {
        Self::new(NodeKind::Value(ValueNode { rows }), vec![])
    }

    pub fn explained(title: &str) -> Self {
        Self::new(
            NodeKind::Explained(ExplainedNode {
                title: title.to_string(),
                attributes: BTreeMap::new(),
            }),
            vec![],
        )
    }

    pub fn filter(condition: &str, input: PlanNode) -> Self {
        Self::new(
            NodeKind::Filter(FilterNode {
                condition: condition.to_string(),
            }),
            vec![input],
        )
    }

    pub fn project(projects: &[&str], input: PlanNode) -> Self {
        Self::new(
            NodeKind::Project(ProjectNode {
                projects: to_strings(projects),
            }),
            vec![input],
        )
    }

    pub fn aggregate(
        agg_type: AggType,
        group_keys: &[&str],
        agg_calls: &[&str],
        input: PlanNode,
    ) -> Self {
        Self::new(
            NodeKind::Aggregate(AggregateNode {
                group_keys: to_strings(group_keys),
                agg_calls: to_strings(agg_calls),
                agg_type,
            }),
            vec![input],
        )
    }

    pub fn window(
        partition_keys: &[&str],
        order_keys: &[&str],
        agg_calls: &[&str],
        input: PlanNode,
    ) -> Self {
        Self::new(
            NodeKind::Window(WindowNode {
                partition_keys: to_strings(partition_keys),
                order_keys: to_strings(order_keys),
                agg_calls: to_strings(agg_calls),
            }),
            vec![input],
        )
    }

    pub fn sort(collations: &[&str], fetch: Option<u64>, input: PlanNode) -> Self {
        Self::new(
            NodeKind::Sort(SortNode {
                collations: to_strings(collations),
                fetch,
                offset: None,
            }),
            vec![input],
        )
    }

    pub fn set_op(set_op_type: SetOpType, all: bool, inputs: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::SetOp(SetOpNode { set_op_type, all }), inputs)
    }

    pub fn join(join_type: JoinType, on: &[(&str, &str)], left: PlanNode, right: PlanNode) -> Self {
        Self::new(
            NodeKind::Join(JoinNode {
                join_type,
                on: on
                    .iter()
                    .map(|(l, r)| (l.to_string(), r.to_string()))
                    .collect(),
            }),
            vec![left, right],
        )
    }

    pub fn exchange(distribution: DistributionType, keys: &[&str], input: PlanNode) -> Self {
        Self::new(
            NodeKind::Exchange(ExchangeNode {
                distribution,
                keys: to_strings(keys),
            }),
            vec![input],
        )
    }

    /// Variant name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::TableScan(_) => "TableScan",
            NodeKind::Value(_) => "Value",
            NodeKind::Filter(_) => "Filter",
            NodeKind::Project(_) => "Project",
            NodeKind::Aggregate(_) => "Aggregate",
            NodeKind::Window(_) => "Window",
            NodeKind::Sort(_) => "Sort",
            NodeKind::SetOp(_) => "SetOp",
            NodeKind::Join(_) => "Join",
            NodeKind::MailboxSend(_) => "MailboxSend",
            NodeKind::MailboxReceive(_) => "MailboxReceive",
            NodeKind::Explained(_) => "Explained",
            NodeKind::Exchange(_) => "Exchange",
        }
    }

    /// Checks the input count expected by the variant.
    pub fn check_arity(&self) -> Result<()> {
        let n = self.inputs.len();
        let ok = match &self.kind {
            NodeKind::TableScan(_)
            | NodeKind::Value(_)
            | NodeKind::Explained(_)
            | NodeKind::MailboxReceive(_) => n == 0,
            NodeKind::Filter(_)
            | NodeKind::Project(_)
            | NodeKind::Aggregate(_)
            | NodeKind::Window(_)
            | NodeKind::Sort(_)
            | NodeKind::MailboxSend(_)
            | NodeKind::Exchange(_) => n == 1,
            NodeKind::Join(_) => n == 2,
            NodeKind::SetOp(_) => n >= 2,
        };
        if ok {
            Ok(())
        } else {
            Err(MsqError::StructuralInconsistency(format!(
                "{} node {} in stage {} has {n} inputs",
                self.kind_name(),
                self.id,
                self.stage_id
            )))
        }
    }

    /// The only input of a unary node.
    pub fn single_input(&self) -> Result<&PlanNode> {
        match self.inputs.as_slice() {
            [input] => Ok(input),
            _ => Err(MsqError::StructuralInconsistency(format!(
                "{} node {} in stage {} expects exactly one input, found {}",
                self.kind_name(),
                self.id,
                self.stage_id,
                self.inputs.len()
            ))),
        }
    }

    /// Whether any node of this subtree scans a table.
    pub fn contains_table_scan(&self) -> bool {
        matches!(self.kind, NodeKind::TableScan(_))
            || self.inputs.iter().any(PlanNode::contains_table_scan)
    }

    /// Tables scanned in this subtree, in pre-order and deduplicated.
    pub fn scanned_tables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_tables(self, &mut out);
        out
    }
}

fn collect_tables<'a>(node: &'a PlanNode, out: &mut Vec<&'a str>) {
    if let NodeKind::TableScan(scan) = &node.kind {
        if !out.contains(&scan.table.as_str()) {
            out.push(&scan.table);
        }
    }
    for input in &node.inputs {
        collect_tables(input, out);
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
