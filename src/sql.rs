use sqlparser::ast::{
    self, AssignmentTarget, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart,
    SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::LimitCount;

/// Parsed command from SQL input. Dates and months stay textual here; the
/// service validates them.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectDefaults,
    SelectDateLimits {
        month: Option<String>,
        date: Option<String>,
    },
    SelectSchedulerStatus,
    InsertDefaults {
        items: Vec<(String, LimitCount)>, // (time_slot, limit_count)
    },
    UpdateDefault {
        time_slot: String,
        limit_count: LimitCount,
    },
    InsertDateLimits {
        rows: Vec<(String, String, LimitCount)>, // (date, time_slot, limit_count)
    },
    UpdateDateLimit {
        date: String,
        time_slot: String,
        limit_count: LimitCount,
    },
    Provision {
        horizon: Option<String>,
    },
    SchedulerStart,
    SchedulerStop,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        Statement::Call(function) => parse_call(function),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::InvalidValue(format!(
            "{} rows in one INSERT, at most {MAX_BATCH_SIZE} allowed",
            rows.len()
        )));
    }

    match table.as_str() {
        "default_limits" => {
            let mut items = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 2 {
                    return Err(SqlError::WrongArity("default_limits", 2, row.len()));
                }
                items.push((
                    parse_string(&row[0]).map_err(|e| e.in_row(i))?,
                    parse_u32(&row[1]).map_err(|e| e.in_row(i))?,
                ));
            }
            Ok(Command::InsertDefaults { items })
        }
        "date_limits" => {
            let mut out = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 3 {
                    return Err(SqlError::WrongArity("date_limits", 3, row.len()));
                }
                out.push((
                    parse_string(&row[0]).map_err(|e| e.in_row(i))?,
                    parse_string(&row[1]).map_err(|e| e.in_row(i))?,
                    parse_u32(&row[2]).map_err(|e| e.in_row(i))?,
                ));
            }
            Ok(Command::InsertDateLimits { rows: out })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let limit_count = extract_limit_assignment(assignments)?;

    let mut filters = Filters::default();
    if let Some(selection) = selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "default_limits" => Ok(Command::UpdateDefault {
            time_slot: filters.time_slot.ok_or(SqlError::MissingFilter("time_slot"))?,
            limit_count,
        }),
        "date_limits" => Ok(Command::UpdateDateLimit {
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
            time_slot: filters.time_slot.ok_or(SqlError::MissingFilter("time_slot"))?,
            limit_count,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "default_limits" => Ok(Command::SelectDefaults),
        "date_limits" => Ok(Command::SelectDateLimits {
            month: filters.month,
            date: filters.date,
        }),
        "scheduler_status" => Ok(Command::SelectSchedulerStatus),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_call(function: &ast::Function) -> Result<Command, SqlError> {
    let name = object_name_last(&function.name)
        .ok_or_else(|| SqlError::Parse("empty procedure name".into()))?;
    let args = function_args(&function.args)?;

    match name.as_str() {
        "provision" => match args.as_slice() {
            [] => Ok(Command::Provision { horizon: None }),
            [horizon] => Ok(Command::Provision {
                horizon: Some(parse_string(horizon)?),
            }),
            _ => Err(SqlError::WrongArity("provision", 1, args.len())),
        },
        "scheduler_start" | "scheduler_stop" if !args.is_empty() => {
            Err(SqlError::WrongArity("scheduler procedures", 0, args.len()))
        }
        "scheduler_start" => Ok(Command::SchedulerStart),
        "scheduler_stop" => Ok(Command::SchedulerStop),
        _ => Err(SqlError::UnknownProcedure(name)),
    }
}

// ── Filters ───────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    month: Option<String>,
    date: Option<String>,
    time_slot: Option<String>,
}

/// Collect `column = 'literal'` terms joined by AND.
fn collect_eq_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, filters)?;
                collect_eq_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("month") => filters.month = Some(parse_string(right)?),
                Some("date") => filters.date = Some(parse_string(right)?),
                Some("time_slot") => filters.time_slot = Some(parse_string(right)?),
                Some(col) => return Err(SqlError::UnknownColumn(col.to_string())),
                None => return Err(SqlError::Unsupported(format!("filter {expr}"))),
            },
            _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, filters)?,
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
}

fn extract_limit_assignment(assignments: &[ast::Assignment]) -> Result<LimitCount, SqlError> {
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported(
            "UPDATE must set exactly limit_count".into(),
        ));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    match column.as_deref() {
        Some("limit_count") => parse_u32(&assignment.value),
        Some(other) => Err(SqlError::UnknownColumn(other.to_string())),
        None => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn function_args(args: &FunctionArguments) -> Result<Vec<Expr>, SqlError> {
    match args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e.clone()),
                other => Err(SqlError::Unsupported(format!("argument {other}"))),
            })
            .collect(),
        FunctionArguments::Subquery(_) => {
            Err(SqlError::Unsupported("subquery as procedure argument".into()))
        }
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            // bound parameters arrive as quoted text
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("limit_count {v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    UnknownProcedure(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    InvalidValue(String),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        match self {
            SqlError::Parse(s) => SqlError::Parse(format!("row {row}: {s}")),
            SqlError::InvalidValue(s) => SqlError::InvalidValue(format!("row {row}: {s}")),
            other => other,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::UnknownProcedure(p) => write!(f, "unknown procedure: {p}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
