//! nsQL syntax tree
//!
//! Trees are built bottom-up by the parser and never mutated afterwards.
//! `Display` renders a tree back into query text that parses to the same tree.

use std::fmt;

use super::lexer::{quote, Collection};

/// Coarse classification driving aggregate mixing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprType {
    /// Constant, including `now()`
    Literal,
    /// Computed per row from column values
    Column,
    /// Computed over a group of rows
    Aggregate,
}

/// What an expression evaluates to, as far as the grammar cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Temporal,
    Numeric,
    Column,
    String,
    Binary,
    Boolean,
    Uuid,
    Interval,
    Collection,
    Null,
    Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(String),
    Float(String),
    String(String),
    Boolean(bool),
    Uuid(String),
    Timestamp(String),
    Date(String),
    Time(String),
    Interval { negative: bool, text: String },
    Binary(Vec<u8>),
    Collection(Collection),
    Null,
}

impl Literal {
    pub fn category(&self) -> Category {
        match self {
            Literal::Integer(_) | Literal::Float(_) => Category::Numeric,
            Literal::String(_) => Category::String,
            Literal::Boolean(_) => Category::Boolean,
            Literal::Uuid(_) => Category::Uuid,
            Literal::Timestamp(_) | Literal::Date(_) | Literal::Time(_) => Category::Temporal,
            Literal::Interval { .. } => Category::Interval,
            Literal::Binary(_) => Category::Binary,
            Literal::Collection(_) => Category::Collection,
            Literal::Null => Category::Null,
        }
    }

    /// Unquoted textual value
    pub fn text(&self) -> String {
        match self {
            Literal::Integer(s)
            | Literal::Float(s)
            | Literal::String(s)
            | Literal::Uuid(s)
            | Literal::Timestamp(s)
            | Literal::Date(s)
            | Literal::Time(s) => s.clone(),
            Literal::Interval { negative, text } => {
                if *negative {
                    format!("-{}", text)
                } else {
                    text.clone()
                }
            }
            Literal::Boolean(b) => b.to_string(),
            Literal::Binary(b) => format!("0x{}", hex::encode(b)),
            Literal::Collection(c) => c.to_string(),
            Literal::Null => "null".to_string(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(s) | Literal::Float(s) => write!(f, "{}", s),
            Literal::String(s)
            | Literal::Uuid(s)
            | Literal::Timestamp(s)
            | Literal::Date(s)
            | Literal::Time(s) => write!(f, "{}", quote(s)),
            Literal::Interval { negative, text } => {
                if *negative {
                    write!(f, "-")?;
                }
                write!(f, "{}", quote(text))
            }
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Binary(b) => write!(f, "'0x{}'", hex::encode(b)),
            Literal::Collection(c) => write!(f, "{}", c),
            Literal::Null => write!(f, "null"),
        }
    }
}

/// Possibly qualified name: `owner.name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub owner: Option<String>,
    pub name: String,
}

impl Identifier {
    pub fn new(owner: Option<&str>, name: &str) -> Self {
        Identifier {
            owner: owner.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn full_name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}.{}", owner, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// Comparator with the opposite truth value
    pub fn negated(&self) -> BinaryOp {
        match self {
            BinaryOp::Eq => BinaryOp::Ne,
            BinaryOp::Ne => BinaryOp::Eq,
            BinaryOp::Lt => BinaryOp::Ge,
            BinaryOp::Ge => BinaryOp::Lt,
            BinaryOp::Gt => BinaryOp::Le,
            BinaryOp::Le => BinaryOp::Gt,
            BinaryOp::And => BinaryOp::Or,
            BinaryOp::Or => BinaryOp::And,
            other => *other,
        }
    }
}

/// Function families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    TableAggregator,
    ColumnAggregator,
    NumericAggregator,
    NumericTransformer,
    TemporalTransformer,
    StringTransformer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionName {
    TCount,
    TCorr,
    TCov,
    Min,
    Max,
    First,
    Last,
    Count,
    Sum,
    Mean,
    Variance,
    Stdev,
    Corr,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    SubtractTimestamps,
    Now,
    JsonFetch,
    MapBlobJsonFetch,
}

impl FunctionName {
    pub fn name(&self) -> &'static str {
        match self {
            FunctionName::TCount => "tcount",
            FunctionName::TCorr => "tcorr",
            FunctionName::TCov => "tcov",
            FunctionName::Min => "min",
            FunctionName::Max => "max",
            FunctionName::First => "first",
            FunctionName::Last => "last",
            FunctionName::Count => "count",
            FunctionName::Sum => "sum",
            FunctionName::Mean => "mean",
            FunctionName::Variance => "variance",
            FunctionName::Stdev => "stdev",
            FunctionName::Corr => "corr",
            FunctionName::Year => "year",
            FunctionName::Month => "month",
            FunctionName::Day => "day",
            FunctionName::Hour => "hour",
            FunctionName::Minute => "minute",
            FunctionName::Second => "second",
            FunctionName::SubtractTimestamps => "subtract_timestamps",
            FunctionName::Now => "now",
            FunctionName::JsonFetch => "json_fetch",
            FunctionName::MapBlobJsonFetch => "map_blob_json_fetch",
        }
    }

    pub fn family(&self) -> Family {
        use FunctionName::*;
        match self {
            TCount | TCorr | TCov => Family::TableAggregator,
            Min | Max | First | Last => Family::ColumnAggregator,
            Count | Sum | Mean | Variance | Stdev | Corr => Family::NumericAggregator,
            Year | Month | Day | Hour | Minute | Second | SubtractTimestamps => {
                Family::NumericTransformer
            }
            Now => Family::TemporalTransformer,
            JsonFetch | MapBlobJsonFetch => Family::StringTransformer,
        }
    }

    pub fn is_aggregator(&self) -> bool {
        matches!(
            self.family(),
            Family::TableAggregator | Family::ColumnAggregator | Family::NumericAggregator
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(Identifier),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary minus on a column expression
    Negate(Box<Expr>),
    Function {
        name: FunctionName,
        params: Vec<Expr>,
    },
    IsNull {
        negated: bool,
        expr: Box<Expr>,
    },
    In {
        negated: bool,
        expr: Box<Expr>,
        query: Box<Query>,
    },
}

/// Expression node with the attributes computed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub category: Category,
    pub expr_type: ExprType,
}

impl Expr {
    pub fn literal(lit: Literal) -> Self {
        let category = lit.category();
        Expr {
            kind: ExprKind::Literal(lit),
            category,
            expr_type: ExprType::Literal,
        }
    }

    pub fn identifier(id: Identifier) -> Self {
        Expr {
            kind: ExprKind::Identifier(id),
            category: Category::Column,
            expr_type: ExprType::Column,
        }
    }

    pub fn as_identifier(&self) -> Option<&Identifier> {
        match &self.kind {
            ExprKind::Identifier(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match &self.kind {
            ExprKind::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Column expression built from an arithmetic operator
    pub fn is_compound_column(&self) -> bool {
        self.category == Category::Column && matches!(self.kind, ExprKind::Binary { .. })
    }

    pub fn has_subquery(&self) -> bool {
        match &self.kind {
            ExprKind::In { .. } => true,
            ExprKind::Binary { left, right, .. } => left.has_subquery() || right.has_subquery(),
            ExprKind::Negate(e) | ExprKind::IsNull { expr: e, .. } => e.has_subquery(),
            ExprKind::Function { params, .. } => params.iter().any(Expr::has_subquery),
            _ => false,
        }
    }

    /// Every column referenced, in order of appearance
    pub fn columns(&self) -> Vec<&Identifier> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a Identifier>) {
        match &self.kind {
            ExprKind::Identifier(id) => out.push(id),
            ExprKind::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            ExprKind::Negate(e) | ExprKind::IsNull { expr: e, .. } | ExprKind::In { expr: e, .. } => {
                e.collect_columns(out)
            }
            ExprKind::Function { params, .. } => {
                for p in params {
                    p.collect_columns(out);
                }
            }
            ExprKind::Literal(_) => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(lit) => write!(f, "{}", lit),
            ExprKind::Identifier(id) => write!(f, "{}", id),
            ExprKind::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            ExprKind::Negate(e) => write!(f, "-{}", e),
            ExprKind::Function { name, params } => {
                let parts: Vec<String> = params.iter().map(|p| p.to_string()).collect();
                write!(f, "{}({})", name.name(), parts.join(", "))
            }
            ExprKind::IsNull { negated, expr } => {
                if *negated {
                    write!(f, "({} is not null)", expr)
                } else {
                    write!(f, "({} is null)", expr)
                }
            }
            ExprKind::In {
                negated,
                expr,
                query,
            } => {
                let op = if *negated { "not in" } else { "in" };
                write!(f, "({} {} ({}))", expr, op, query)
            }
        }
    }
}

/// One entry of a projection or group-by list
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    /// Name the item is known by in the output
    pub fn reference(&self) -> String {
        match self {
            SelectItem::Wildcard => "*".to_string(),
            SelectItem::Expr { expr, alias } => match (alias, expr.as_identifier()) {
                (Some(alias), _) => alias.clone(),
                (None, Some(id)) => id.name.clone(),
                (None, None) => expr.to_string(),
            },
        }
    }

    pub fn expr(&self) -> Option<&Expr> {
        match self {
            SelectItem::Wildcard => None,
            SelectItem::Expr { expr, .. } => Some(expr),
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            SelectItem::Expr { alias: Some(a), .. } => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard => write!(f, "*"),
            SelectItem::Expr { expr, alias: None } => write!(f, "{}", expr),
            SelectItem::Expr {
                expr,
                alias: Some(alias),
            } => write!(f, "{} as {}", expr, alias),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Table(Identifier),
    Subquery(Box<Query>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub source: TableSource,
    pub alias: Option<String>,
}

impl TableRef {
    /// Name other clauses use to refer to this table
    pub fn reference(&self) -> String {
        match (&self.alias, &self.source) {
            (Some(alias), _) => alias.clone(),
            (None, TableSource::Table(id)) => id.name.clone(),
            (None, TableSource::Subquery(q)) => q.to_string(),
        }
    }

    pub fn table(&self) -> Option<&Identifier> {
        match &self.source {
            TableSource::Table(id) => Some(id),
            TableSource::Subquery(_) => None,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            TableSource::Table(id) => write!(f, "{}", id)?,
            TableSource::Subquery(q) => write!(f, "({})", q)?,
        }
        if let Some(alias) = &self.alias {
            write!(f, " as {}", alias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
}

impl JoinKind {
    pub fn keywords(&self) -> &'static str {
        match self {
            JoinKind::Inner => "inner join",
            JoinKind::LeftOuter => "left outer join",
            JoinKind::RightOuter => "right outer join",
            JoinKind::FullOuter => "full outer join",
            JoinKind::LeftSemi => "left semi join",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupBy {
    pub items: Vec<SelectItem>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Option<GroupBy>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
}

impl Select {
    /// Output column names, group-by references first
    pub fn output_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(group) = &self.group_by {
            out.extend(group.items.iter().map(SelectItem::reference));
        }
        out.extend(self.items.iter().map(SelectItem::reference));
        out
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.items.iter().map(|i| i.to_string()).collect();
        write!(
            f,
            "select {} {} from {}",
            if self.distinct { "distinct" } else { "all" },
            items.join(", "),
            self.from
        )?;
        for join in &self.joins {
            write!(f, " {} {}", join.kind.keywords(), join.table)?;
            if let Some(on) = &join.on {
                write!(f, " on {}", on)?;
            }
        }
        if let Some(cond) = &self.where_clause {
            write!(f, " where {}", cond)?;
        }
        if let Some(group) = &self.group_by {
            let items: Vec<String> = group.items.iter().map(|i| i.to_string()).collect();
            write!(f, " group by {}", items.join(", "))?;
            if let Some(having) = &group.having {
                write!(f, " having {}", having)?;
            }
        }
        if !self.order_by.is_empty() {
            let items: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.expr, if o.descending { "desc" } else { "asc" }))
                .collect();
            write!(f, " order by {}", items.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {}", limit)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    UnionAll,
    Intersect,
}

impl SetOperator {
    pub fn keywords(&self) -> &'static str {
        match self {
            SetOperator::Union => "union",
            SetOperator::UnionAll => "union all",
            SetOperator::Intersect => "intersect",
        }
    }
}

/// A select, or selects combined by set operators
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<Select>),
    Compound {
        op: SetOperator,
        left: Box<Query>,
        right: Box<Query>,
    },
}

impl Query {
    pub fn as_select(&self) -> Option<&Select> {
        match self {
            Query::Select(s) => Some(s),
            Query::Compound { .. } => None,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Select(s) => write!(f, "{}", s),
            Query::Compound { op, left, right } => {
                match left.as_ref() {
                    Query::Select(s) => write!(f, "({})", s)?,
                    compound => write!(f, "{}", compound)?,
                }
                write!(f, " {} ({})", op.keywords(), right)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: Identifier,
    pub columns: Vec<Identifier>,
    pub values: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: Identifier,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: Identifier,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: Identifier,
    pub where_clause: Option<Expr>,
}

/// Storage type of a column in `create table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Simple(String),
    Set(Box<FieldType>),
    List(Box<FieldType>),
    Map(Box<FieldType>, Box<FieldType>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Simple(name) => write!(f, "{}", name),
            FieldType::Set(t) => write!(f, "set<{}>", t),
            FieldType::List(t) => write!(f, "list<{}>", t),
            FieldType::Map(k, v) => write!(f, "map<{}, {}>", k, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub partitioning: Vec<String>,
    pub clustering: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusteringOrder {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    pub if_not_exists: bool,
    pub table: Identifier,
    pub fields: Vec<FieldDescription>,
    pub primary_key: PrimaryKey,
    pub clustering_order: Vec<ClusteringOrder>,
    pub compact_storage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTable {
    pub if_exists: bool,
    pub table: Identifier,
}

/// Root of a parsed query
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query(Query),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    CreateTable(CreateTable),
    DropTable(DropTable),
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Query(q) => write!(f, "{}", q)?,
            Statement::Insert(i) => {
                let cols: Vec<String> = i.columns.iter().map(|c| c.to_string()).collect();
                let vals: Vec<String> = i.values.iter().map(|v| v.to_string()).collect();
                write!(
                    f,
                    "insert into {} ({}) values ({})",
                    i.table,
                    cols.join(", "),
                    vals.join(", ")
                )?;
            }
            Statement::Update(u) => {
                let sets: Vec<String> = u
                    .assignments
                    .iter()
                    .map(|a| format!("{} = {}", a.column, a.value))
                    .collect();
                write!(f, "update {} set {}", u.table, sets.join(", "))?;
                if let Some(cond) = &u.where_clause {
                    write!(f, " where {}", cond)?;
                }
            }
            Statement::Delete(d) => {
                write!(f, "delete from {}", d.table)?;
                if let Some(cond) = &d.where_clause {
                    write!(f, " where {}", cond)?;
                }
            }
            Statement::CreateTable(c) => {
                write!(f, "create table ")?;
                if c.if_not_exists {
                    write!(f, "if not exists ")?;
                }
                let fields: Vec<String> = c
                    .fields
                    .iter()
                    .map(|d| format!("{} {}", d.name, d.field_type))
                    .collect();
                let partitioning = if c.primary_key.partitioning.len() == 1 {
                    c.primary_key.partitioning[0].clone()
                } else {
                    format!("({})", c.primary_key.partitioning.join(", "))
                };
                let mut key = vec![partitioning];
                key.extend(c.primary_key.clustering.iter().cloned());
                write!(
                    f,
                    "{} ({}, primary key ({}))",
                    c.table,
                    fields.join(", "),
                    key.join(", ")
                )?;
                let mut directives = Vec::new();
                if !c.clustering_order.is_empty() {
                    let order: Vec<String> = c
                        .clustering_order
                        .iter()
                        .map(|o| format!("{} {}", o.column, if o.descending { "desc" } else { "asc" }))
                        .collect();
                    directives.push(format!("clustering order by ({})", order.join(", ")));
                }
                if c.compact_storage {
                    directives.push("compact storage".to_string());
                }
                if !directives.is_empty() {
                    write!(f, " with {}", directives.join(" and "))?;
                }
            }
            Statement::DropTable(d) => {
                write!(f, "drop table ")?;
                if d.if_exists {
                    write!(f, "if exists ")?;
                }
                write!(f, "{}", d.table)?;
            }
        }
        write!(f, ";")
    }
}
