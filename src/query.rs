use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use rusqlite::types::{Value as SqlValue, ValueRef};
use tracing::debug;

use crate::session::{quote_ident, Session, TableInfo};

/// A table-qualified column reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    fn render(&self) -> String {
        format!("{}.{}", quote_ident(&self.table), quote_ident(&self.column))
    }
}

/// A literal predicate operand, bound as a SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Literal::Text(s) => SqlValue::Text(s.clone()),
            Literal::Integer(i) => SqlValue::Integer(*i),
            Literal::Real(f) => SqlValue::Real(*f),
            Literal::Bool(b) => SqlValue::Integer(*b as i64),
            Literal::Null => SqlValue::Null,
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Text(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Text(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Integer(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Integer(value as i64)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Real(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

/// Either side of a comparison: another column or a literal value, so
/// predicates compose with raw values and handles interchangeably.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(ColumnRef),
    Value(Literal),
}

impl From<&ColumnHandle> for Operand {
    fn from(handle: &ColumnHandle) -> Self {
        Operand::Column(handle.column.clone())
    }
}

impl From<ColumnHandle> for Operand {
    fn from(handle: ColumnHandle) -> Self {
        Operand::Column(handle.column)
    }
}

impl From<Literal> for Operand {
    fn from(value: Literal) -> Self {
        Operand::Value(value)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Operand::Value(value.into())
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Operand::Value(value.into())
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Value(value.into())
    }
}

impl From<i32> for Operand {
    fn from(value: i32) -> Self {
        Operand::Value(value.into())
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Value(value.into())
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Operand::Value(value.into())
    }
}

/// An immutable filter/join expression tree. Building one never touches
/// the store; it is rendered to SQL at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(ColumnRef, Operand),
    Ne(ColumnRef, Operand),
    In(ColumnRef, Vec<Literal>),
    NotIn(ColumnRef, Vec<Literal>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        match self {
            Predicate::Eq(column, operand) => {
                sql.push_str(&column.render());
                match operand {
                    Operand::Column(other) => {
                        sql.push_str(" = ");
                        sql.push_str(&other.render());
                    }
                    Operand::Value(Literal::Null) => sql.push_str(" IS NULL"),
                    Operand::Value(value) => {
                        sql.push_str(" = ?");
                        params.push(value.to_sql_value());
                    }
                }
            }
            Predicate::Ne(column, operand) => {
                sql.push_str(&column.render());
                match operand {
                    Operand::Column(other) => {
                        sql.push_str(" != ");
                        sql.push_str(&other.render());
                    }
                    Operand::Value(Literal::Null) => sql.push_str(" IS NOT NULL"),
                    Operand::Value(value) => {
                        sql.push_str(" != ?");
                        params.push(value.to_sql_value());
                    }
                }
            }
            Predicate::In(column, values) => {
                if values.is_empty() {
                    // Membership in the empty set never holds.
                    sql.push_str("1 = 0");
                } else {
                    sql.push_str(&column.render());
                    sql.push_str(" IN (");
                    sql.push_str(&vec!["?"; values.len()].join(", "));
                    sql.push(')');
                    params.extend(values.iter().map(Literal::to_sql_value));
                }
            }
            Predicate::NotIn(column, values) => {
                if values.is_empty() {
                    sql.push_str("1 = 1");
                } else {
                    sql.push_str(&column.render());
                    sql.push_str(" NOT IN (");
                    sql.push_str(&vec!["?"; values.len()].join(", "));
                    sql.push(')');
                    params.extend(values.iter().map(Literal::to_sql_value));
                }
            }
            Predicate::And(left, right) => {
                sql.push('(');
                left.render(sql, params);
                sql.push_str(" AND ");
                right.render(sql, params);
                sql.push(')');
            }
            Predicate::Or(left, right) => {
                sql.push('(');
                left.render(sql, params);
                sql.push_str(" OR ");
                right.render(sql, params);
                sql.push(')');
            }
        }
    }
}

/// Facade over a single column. Comparison helpers build predicates and
/// never mutate.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnHandle {
    column: ColumnRef,
}

impl ColumnHandle {
    fn new(table: &str, column: &str) -> Self {
        Self {
            column: ColumnRef {
                table: table.to_string(),
                column: column.to_string(),
            },
        }
    }

    pub fn table_name(&self) -> &str {
        &self.column.table
    }

    pub fn name(&self) -> &str {
        &self.column.column
    }

    pub fn eq(&self, other: impl Into<Operand>) -> Predicate {
        Predicate::Eq(self.column.clone(), other.into())
    }

    pub fn ne(&self, other: impl Into<Operand>) -> Predicate {
        Predicate::Ne(self.column.clone(), other.into())
    }

    pub fn in_list<I, T>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        Predicate::In(
            self.column.clone(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn not_in_list<I, T>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = T>,
        T: Into<Literal>,
    {
        Predicate::NotIn(
            self.column.clone(),
            values.into_iter().map(Into::into).collect(),
        )
    }
}

/// Join kinds mirror the remote client's naming. `Left` performs a
/// plain (inner) join and `Full` a left outer join; the mismatch is
/// longstanding observed behavior and is kept rather than corrected.
/// `Right` is unimplemented and fails on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Right,
    Full,
}

/// Facade over one materialized table, or an aliased view of it.
#[derive(Debug, Clone)]
pub struct TableHandle<'a> {
    session: &'a Session,
    info: &'a TableInfo,
    alias: Option<String>,
}

impl<'a> TableHandle<'a> {
    pub(crate) fn new(session: &'a Session, info: &'a TableInfo) -> Self {
        Self {
            session,
            info,
            alias: None,
        }
    }

    /// The name this handle is addressed by: the alias if one was set,
    /// otherwise the table name.
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.info.name)
    }

    /// The same table under a different name, for self-joins.
    pub fn alias(&self, name: &str) -> TableHandle<'a> {
        TableHandle {
            session: self.session,
            info: self.info,
            alias: Some(name.to_string()),
        }
    }

    /// Explicit name → handle map over this table's columns.
    pub fn column_definitions(&self) -> BTreeMap<String, ColumnHandle> {
        self.info
            .columns
            .iter()
            .map(|c| (c.clone(), ColumnHandle::new(self.name(), c)))
            .collect()
    }

    pub fn column(&self, name: &str) -> Result<ColumnHandle> {
        if self.info.columns.iter().any(|c| c == name) {
            Ok(ColumnHandle::new(self.name(), name))
        } else {
            bail!("table '{}' has no column '{}'", self.name(), name)
        }
    }

    fn render_from(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", quote_ident(&self.info.name), quote_ident(alias)),
            None => quote_ident(&self.info.name),
        }
    }

    /// Start a query with this table as the subject.
    pub fn query(&self) -> QueryHandle<'a> {
        let mut path = BTreeMap::new();
        path.insert(self.name().to_string(), self.clone());
        QueryHandle {
            session: self.session,
            subject: self.name().to_string(),
            ops: Vec::new(),
            path,
        }
    }

    pub fn filter(&self, predicate: Predicate) -> QueryHandle<'a> {
        self.query().filter(predicate)
    }

    pub fn link(
        &self,
        other: &TableHandle<'a>,
        on: Predicate,
        kind: JoinKind,
    ) -> Result<QueryHandle<'a>> {
        self.query().link(other, on, kind)
    }

    pub fn groupby(&self, columns: &[&ColumnHandle]) -> QueryHandle<'a> {
        self.query().groupby(columns)
    }

    pub fn entities(&self) -> Result<Entities> {
        self.query().entities()
    }

    pub fn count(&self) -> Result<u64> {
        self.query().count()
    }
}

#[derive(Debug, Clone)]
enum PlanOp {
    Filter(Predicate),
    Join {
        from: String,
        table: String,
        on: Predicate,
        kind: JoinKind,
    },
    GroupBy(Vec<ColumnRef>),
}

/// An accumulating, immutable query: every operation returns a new
/// handle with one more plan step, and nothing executes until
/// `entities()` or `count()` interprets the plan.
#[derive(Debug, Clone)]
pub struct QueryHandle<'a> {
    session: &'a Session,
    subject: String,
    ops: Vec<PlanOp>,
    path: BTreeMap<String, TableHandle<'a>>,
}

impl<'a> QueryHandle<'a> {
    /// The table driving `entities()` and `count()`.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Tables reachable by name from this query chain.
    pub fn path(&self) -> &BTreeMap<String, TableHandle<'a>> {
        &self.path
    }

    pub fn table(&self, name: &str) -> Option<&TableHandle<'a>> {
        self.path.get(name)
    }

    /// Additionally restrict results to rows satisfying `predicate`.
    pub fn filter(&self, predicate: Predicate) -> QueryHandle<'a> {
        let mut next = self.clone();
        next.ops.push(PlanOp::Filter(predicate));
        next
    }

    /// Join `other` onto the current query. `JoinKind::Right` fails
    /// here, before any plan is built.
    pub fn link(
        &self,
        other: &TableHandle<'a>,
        on: Predicate,
        kind: JoinKind,
    ) -> Result<QueryHandle<'a>> {
        if kind == JoinKind::Right {
            bail!("right joins are not implemented");
        }
        let mut next = self.clone();
        next.ops.push(PlanOp::Join {
            from: self.subject.clone(),
            table: other.name().to_string(),
            on,
            kind,
        });
        next.path.insert(other.name().to_string(), other.clone());
        Ok(next)
    }

    pub fn groupby(&self, columns: &[&ColumnHandle]) -> QueryHandle<'a> {
        let mut next = self.clone();
        next.ops.push(PlanOp::GroupBy(
            columns.iter().map(|c| c.column.clone()).collect(),
        ));
        next
    }

    /// Make `other` the subject, preserving the accumulated plan and
    /// path mapping.
    pub fn pivot(&self, other: &TableHandle<'a>) -> QueryHandle<'a> {
        let mut next = self.clone();
        next.subject = other.name().to_string();
        next.path.insert(other.name().to_string(), other.clone());
        next
    }

    /// Tables contributing columns to the result: the subject first,
    /// then both sides of each join in join order.
    fn result_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.subject.as_str()];
        for op in &self.ops {
            if let PlanOp::Join { from, table, .. } = op {
                for name in [from.as_str(), table.as_str()] {
                    if !tables.contains(&name) {
                        tables.push(name);
                    }
                }
            }
        }
        tables
    }

    /// Result columns in order, duplicate names skipped (first table
    /// wins).
    fn select_columns(&self) -> Result<Vec<ColumnRef>> {
        let mut columns = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        for table in self.result_tables() {
            let handle = self
                .path
                .get(table)
                .with_context(|| format!("table '{}' is not reachable from this query", table))?;
            for column in &handle.info.columns {
                if !seen.contains(&column.as_str()) {
                    seen.push(column);
                    columns.push(ColumnRef {
                        table: table.to_string(),
                        column: column.clone(),
                    });
                }
            }
        }
        Ok(columns)
    }

    /// Interpret the plan into one SELECT statement with bound
    /// parameters.
    fn build_sql(&self, select_list: &str) -> Result<(String, Vec<SqlValue>)> {
        let subject = self
            .path
            .get(&self.subject)
            .with_context(|| format!("unknown subject table '{}'", self.subject))?;
        let mut sql = format!("SELECT {} FROM {}", select_list, subject.render_from());
        let mut params = Vec::new();

        // The FROM chain starts at the subject and grows one table per
        // join. A pivot can re-root the chain on either side of a
        // recorded join, so each pass attaches whichever side is still
        // missing; joins whose tables are both unreached wait for a
        // later pass to connect one of them.
        let mut joined: Vec<&str> = vec![self.subject.as_str()];
        let mut pending: Vec<(&str, &str, &Predicate, JoinKind)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::Join {
                    from,
                    table,
                    on,
                    kind,
                } => Some((from.as_str(), table.as_str(), on, *kind)),
                _ => None,
            })
            .collect();
        while !pending.is_empty() {
            let mut deferred = Vec::new();
            let mut progressed = false;
            for (from, table, on, kind) in pending {
                let next_table = match (joined.contains(&from), joined.contains(&table)) {
                    (true, true) => continue,
                    (true, false) => table,
                    (false, true) => from,
                    (false, false) => {
                        deferred.push((from, table, on, kind));
                        continue;
                    }
                };
                joined.push(next_table);
                progressed = true;
                let handle = self.path.get(next_table).with_context(|| {
                    format!("table '{}' is not reachable from this query", next_table)
                })?;
                let keyword = match kind {
                    JoinKind::Left => "JOIN",
                    JoinKind::Full => "LEFT OUTER JOIN",
                    JoinKind::Right => bail!("right joins are not implemented"),
                };
                sql.push_str(&format!(" {} {} ON ", keyword, handle.render_from()));
                on.render(&mut sql, &mut params);
            }
            if !progressed && !deferred.is_empty() {
                let (from, table, ..) = deferred[0];
                bail!(
                    "join between '{}' and '{}' is not connected to subject '{}'",
                    from,
                    table,
                    self.subject
                );
            }
            pending = deferred;
        }

        let mut first_filter = true;
        for op in &self.ops {
            if let PlanOp::Filter(predicate) = op {
                sql.push_str(if first_filter { " WHERE " } else { " AND " });
                first_filter = false;
                predicate.render(&mut sql, &mut params);
            }
        }

        let group_columns: Vec<String> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::GroupBy(columns) => Some(columns.iter().map(ColumnRef::render)),
                _ => None,
            })
            .flatten()
            .collect();
        if !group_columns.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_columns.join(", "));
        }

        Ok((sql, params))
    }

    /// Execute the plan and return one mapping per result row, column
    /// name → stringified value, omitting null-like values. The full
    /// result set is read into memory here; the returned iterator
    /// walks buffered rows and holds no statement open.
    pub fn entities(&self) -> Result<Entities> {
        let columns = self.select_columns()?;
        let select_list = columns
            .iter()
            .map(ColumnRef::render)
            .collect::<Vec<_>>()
            .join(", ");
        let (sql, params) = self.build_sql(&select_list)?;
        debug!(target: "query", "executing: {}", sql);

        let conn = self.session.connection();
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query: {}", sql))?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .with_context(|| format!("failed to execute query: {}", sql))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = BTreeMap::new();
            for (idx, column) in columns.iter().enumerate() {
                if let Some(text) = display_value(row.get_ref(idx)?) {
                    record.insert(column.column.clone(), text);
                }
            }
            records.push(record);
        }

        let progress = if self.session.progress_enabled() {
            Some(ProgressBar::new(records.len() as u64))
        } else {
            None
        };
        Ok(Entities {
            rows: records.into_iter(),
            progress,
        })
    }

    /// Execute the plan and return the result row count (grouped
    /// queries count groups).
    pub fn count(&self) -> Result<u64> {
        let (inner, params) = self.build_sql("1")?;
        let sql = format!("SELECT COUNT(*) FROM ({})", inner);
        debug!(target: "query", "executing: {}", sql);
        let count: i64 = self
            .session
            .connection()
            .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to execute query: {}", sql))?;
        Ok(count as u64)
    }
}

/// OR-of-equalities convenience: restrict `query` to rows whose
/// `column` equals any of `values`. An empty candidate list returns the
/// query unfiltered.
pub fn filter_any<'a, I, T>(
    query: QueryHandle<'a>,
    column: &ColumnHandle,
    values: I,
) -> QueryHandle<'a>
where
    I: IntoIterator<Item = T>,
    T: Into<Literal>,
{
    let mut predicate: Option<Predicate> = None;
    for value in values {
        let clause = column.eq(value.into());
        predicate = Some(match predicate {
            None => clause,
            Some(prior) => prior.or(clause),
        });
    }
    match predicate {
        None => query,
        Some(predicate) => query.filter(predicate),
    }
}

/// Finite single-pass sequence of row mappings from `entities()`.
pub struct Entities {
    rows: std::vec::IntoIter<BTreeMap<String, String>>,
    progress: Option<ProgressBar>,
}

impl Iterator for Entities {
    type Item = BTreeMap<String, String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rows.next() {
            Some(row) => {
                if let Some(bar) = &self.progress {
                    bar.inc(1);
                }
                Some(row)
            }
            None => {
                if let Some(bar) = self.progress.take() {
                    bar.finish_and_clear();
                }
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Entities {}

/// Stringify one cell, dropping null-like values: SQL NULL, empty text,
/// zero, and false (booleans are stored as 0/1). Matches the remote
/// client's entity rendering.
fn display_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(0) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) if f == 0.0 => None,
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            if bytes.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}
