use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::payment::{PaymentNotification, PaymentPlan};

/// Which bookings a `SELECT * FROM bookings` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Code(String),
    OrderCode(i64),
    Email(String),
    Date(NaiveDate),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    Reserve {
        request: ReservationRequest,
    },
    CancelBooking {
        code: String,
    },
    CompleteBooking {
        code: String,
    },
    StartPayment {
        code: String,
        plan: PaymentPlan,
        description: Option<String>,
        return_url: String,
        cancel_url: String,
    },
    PaymentNotification {
        notification: PaymentNotification,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectOccupiedSlots {
        room_id: Ulid,
        date: NaiveDate,
    },
    SelectBookingStats {
        email: String,
    },
}

const BOOKING_COLUMNS: &[&str] = &[
    "room_id",
    "date",
    "slot_ids",
    "name",
    "email",
    "phone",
    "film_id",
    "combo_id",
    "promotion_code",
];
const COMPLETION_COLUMNS: &[&str] = &["code"];
const PAYMENT_LINK_COLUMNS: &[&str] = &["code", "plan", "description", "return_url", "cancel_url"];
const NOTIFICATION_COLUMNS: &[&str] = &["order_code", "amount", "code", "signature"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "bookings" => {
            let row = Row::from_insert(insert, "bookings", BOOKING_COLUMNS)?;
            let request = ReservationRequest {
                room_id: parse_ulid(row.required("room_id")?)?,
                date: parse_date(row.required("date")?)?,
                slot_ids: parse_ulid_list(row.required("slot_ids")?)?,
                customer: Customer {
                    name: parse_string(row.required("name")?)?,
                    email: parse_string(row.required("email")?)?,
                    phone: parse_string(row.required("phone")?)?,
                },
                film_id: row.optional("film_id").map(parse_ulid_or_null).transpose()?.flatten(),
                combo_id: row.optional("combo_id").map(parse_ulid_or_null).transpose()?.flatten(),
                promotion_code: row.optional_text("promotion_code")?,
            };
            Ok(Command::Reserve { request })
        }
        "completions" => {
            let row = Row::from_insert(insert, "completions", COMPLETION_COLUMNS)?;
            Ok(Command::CompleteBooking {
                code: parse_string(row.required("code")?)?,
            })
        }
        "payment_links" => {
            let row = Row::from_insert(insert, "payment_links", PAYMENT_LINK_COLUMNS)?;
            let plan_text = parse_string(row.required("plan")?)?;
            let plan = PaymentPlan::parse(&plan_text)
                .ok_or_else(|| SqlError::Parse(format!("unknown payment plan: {plan_text}")))?;
            Ok(Command::StartPayment {
                code: parse_string(row.required("code")?)?,
                plan,
                description: row.optional_text("description")?,
                return_url: row.optional_text("return_url")?.unwrap_or_default(),
                cancel_url: row.optional_text("cancel_url")?.unwrap_or_default(),
            })
        }
        "payment_notifications" => {
            let row = Row::from_insert(insert, "payment_notifications", NOTIFICATION_COLUMNS)?;
            Ok(Command::PaymentNotification {
                notification: PaymentNotification {
                    order_code: parse_i64(row.required("order_code")?)?,
                    amount: parse_i64(row.required("amount")?)?,
                    code: parse_string(row.required("code")?)?,
                    signature: parse_string(row.required("signature")?)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = where_filters(delete.selection.as_ref());
    Ok(Command::CancelBooking {
        code: parse_string(find_filter(&filters, "code")?)?,
    })
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
    let filters = where_filters(select.selection.as_ref());
    let filter = |name| find_filter(&filters, name);

    match table.as_str() {
        "bookings" => {
            let by = if let Ok(e) = filter("code") {
                BookingFilter::Code(parse_string(e)?)
            } else if let Ok(e) = filter("order_code") {
                BookingFilter::OrderCode(parse_i64(e)?)
            } else if let Ok(e) = filter("email") {
                BookingFilter::Email(parse_string(e)?)
            } else if let Ok(e) = filter("date") {
                BookingFilter::Date(parse_date(e)?)
            } else {
                return Err(SqlError::MissingFilter("code, order_code, email or date"));
            };
            Ok(Command::SelectBookings { filter: by })
        }
        "occupied_slots" => Ok(Command::SelectOccupiedSlots {
            room_id: parse_ulid(filter("room_id")?)?,
            date: parse_date(filter("date")?)?,
        }),
        "booking_stats" => Ok(Command::SelectBookingStats {
            email: parse_string(filter("email")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn find_filter<'a>(filters: &[(String, &'a Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(col, _)| col == name)
        .map(|(_, e)| *e)
        .ok_or(SqlError::MissingFilter(name))
}

/// `col = value` pairs joined by AND. Other predicates are ignored.
fn where_filters(selection: Option<&Expr>) -> Vec<(String, &Expr)> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, &**right));
                }
            }
            Expr::Nested(inner) => walk(inner, out),
            _ => {}
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out);
    }
    out
}

/// One VALUES row keyed by column name. Without an explicit column list the
/// values are matched positionally against `positional`.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn from_insert(
        insert: &'a ast::Insert,
        table: &'static str,
        positional: &[&str],
    ) -> Result<Self, SqlError> {
        let values = first_values_row(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            if values.len() > positional.len() {
                return Err(SqlError::WrongArity(table, positional.len(), values.len()));
            }
            positional[..values.len()].iter().map(|s| s.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = names.iter().find(|n| !positional.contains(&n.as_str())) {
            return Err(SqlError::Parse(format!("{table}: unknown column {unknown}")));
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(name, _)| name == col).map(|(_, e)| *e)
    }

    /// Text column where NULL and absent mean the same thing.
    fn optional_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.optional(col)
            .map(parse_string_or_null)
            .transpose()
            .map(Option::flatten)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(col)
            .ok_or(SqlError::MissingColumn(self.table, col))
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn first_values_row(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(_) => parse_ulid(expr).map(Some),
    }
}

/// Comma-separated ULIDs in one string.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))))
        .collect()
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const SLOT_A: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const SLOT_B: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    #[test]
    fn parse_reserve_positional() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{ROOM}', '2025-05-23', '{SLOT_A},{SLOT_B}', 'An', 'an@example.com', '0900000001')"
        );
        match parse_sql(&sql).unwrap() {
            Command::Reserve { request } => {
                assert_eq!(request.room_id.to_string(), ROOM);
                assert_eq!(request.date, NaiveDate::from_ymd_opt(2025, 5, 23).unwrap());
                assert_eq!(request.slot_ids.len(), 2);
                assert_eq!(request.slot_ids[1].to_string(), SLOT_B);
                assert_eq!(request.customer.email, "an@example.com");
                assert_eq!(request.promotion_code, None);
                assert_eq!(request.combo_id, None);
            }
            other => panic!("expected Reserve, got {other:?}"),
        }
    }

    #[test]
    fn parse_reserve_named_columns() {
        let sql = format!(
            "INSERT INTO bookings (email, name, phone, date, room_id, slot_ids, promotion_code, combo_id) \
             VALUES ('an@example.com', 'An', '0900000001', '2025-05-23', '{ROOM}', '{SLOT_A}', 'SALE10', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::Reserve { request } => {
                assert_eq!(request.customer.name, "An");
                assert_eq!(request.slot_ids.len(), 1);
                assert_eq!(request.promotion_code.as_deref(), Some("SALE10"));
                assert_eq!(request.combo_id, None);
            }
            other => panic!("expected Reserve, got {other:?}"),
        }
    }

    #[test]
    fn parse_reserve_missing_column() {
        let sql = format!("INSERT INTO bookings (room_id, date) VALUES ('{ROOM}', '2025-05-23')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("bookings", "slot_ids"))
        ));
    }

    #[test]
    fn parse_reserve_bad_values() {
        let bad_date = format!(
            "INSERT INTO bookings VALUES ('{ROOM}', '23/05/2025', '{SLOT_A}', 'An', 'a@b.c', '1')"
        );
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));
        let bad_slot = format!(
            "INSERT INTO bookings VALUES ('{ROOM}', '2025-05-23', 'nope', 'An', 'a@b.c', '1')"
        );
        assert!(matches!(parse_sql(&bad_slot), Err(SqlError::Parse(_))));
        let too_many = format!(
            "INSERT INTO bookings VALUES ('{ROOM}', '2025-05-23', '{SLOT_A}', 'An', 'a@b.c', '1', NULL, NULL, NULL, 'extra')"
        );
        assert!(matches!(parse_sql(&too_many), Err(SqlError::WrongArity("bookings", 9, 10))));
    }

    #[test]
    fn parse_cancel() {
        let cmd = parse_sql("DELETE FROM bookings WHERE code = '2305000'").unwrap();
        assert_eq!(cmd, Command::CancelBooking { code: "2305000".into() });
        assert!(matches!(
            parse_sql("DELETE FROM bookings WHERE id = '2305000'"),
            Err(SqlError::MissingFilter("code"))
        ));
    }

    #[test]
    fn parse_completion() {
        let cmd = parse_sql("INSERT INTO completions (code) VALUES ('2305000')").unwrap();
        assert_eq!(cmd, Command::CompleteBooking { code: "2305000".into() });
    }

    #[test]
    fn parse_payment_link() {
        let cmd = parse_sql(
            "INSERT INTO payment_links (code, plan, return_url) VALUES ('2305000', 'deposit', 'https://shop/ok')",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::StartPayment {
                code: "2305000".into(),
                plan: PaymentPlan::Deposit,
                description: None,
                return_url: "https://shop/ok".into(),
                cancel_url: String::new(),
            }
        );
        assert!(matches!(
            parse_sql("INSERT INTO payment_links VALUES ('2305000', 'half')"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_payment_notification() {
        let cmd = parse_sql(
            "INSERT INTO payment_notifications VALUES (100001, 200000, '00', 'abcdef')",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::PaymentNotification {
                notification: PaymentNotification {
                    order_code: 100_001,
                    amount: 200_000,
                    code: "00".into(),
                    signature: "abcdef".into(),
                }
            }
        );
    }

    #[test]
    fn parse_select_bookings_filters() {
        let cases = [
            ("code = '2305000'", BookingFilter::Code("2305000".into())),
            ("order_code = 100001", BookingFilter::OrderCode(100_001)),
            ("email = 'an@example.com'", BookingFilter::Email("an@example.com".into())),
            (
                "date = '2025-05-23'",
                BookingFilter::Date(NaiveDate::from_ymd_opt(2025, 5, 23).unwrap()),
            ),
        ];
        for (clause, expected) in cases {
            let cmd = parse_sql(&format!("SELECT * FROM bookings WHERE {clause}")).unwrap();
            assert_eq!(cmd, Command::SelectBookings { filter: expected });
        }
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_occupied_slots() {
        let sql = format!("SELECT * FROM occupied_slots WHERE room_id = '{ROOM}' AND date = '2025-05-23'");
        match parse_sql(&sql).unwrap() {
            Command::SelectOccupiedSlots { room_id, date } => {
                assert_eq!(room_id.to_string(), ROOM);
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 5, 23).unwrap());
            }
            other => panic!("expected SelectOccupiedSlots, got {other:?}"),
        }
        let missing = format!("SELECT * FROM occupied_slots WHERE room_id = '{ROOM}'");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_stats() {
        let cmd = parse_sql("SELECT * FROM booking_stats WHERE email = 'an@example.com'").unwrap();
        assert_eq!(cmd, Command::SelectBookingStats { email: "an@example.com".into() });
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM resources WHERE id = 'x'"),
            Err(SqlError::UnknownTable(t)) if t == "resources"
        ));
        assert!(matches!(
            parse_sql("INSERT INTO holds VALUES ('x')"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_unsupported_statement() {
        assert!(matches!(
            parse_sql("CREATE TABLE t (id INT)"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(parse_sql("").is_err());
    }
}
