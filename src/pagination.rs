//! Keyset pagination.
//!
//! A list request ([`ListParams`]) is turned into a fully parameterized query
//! ordered by the requested sort column and then by a unique id column. The
//! id breaks ties, so paging with a cursor taken from the last (or first) row
//! of a page never skips or repeats rows that share a sort value.

use crate::db::params::QueryParam;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_LIST_LIMIT: u32 = 25;
pub const MAX_LIST_LIMIT: u32 = 1000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Comparison selecting rows that come after a cursor in this order.
    fn after_op(&self) -> &'static str {
        match self {
            Self::Asc => ">",
            Self::Desc => "<",
        }
    }

    /// Comparison selecting rows that come before a cursor in this order.
    fn before_op(&self) -> &'static str {
        match self {
            Self::Asc => "<",
            Self::Desc => ">",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A list request.
///
/// `after_*` is the cursor of the last row already seen (next page),
/// `before_*` the cursor of the first row already seen (previous page). The
/// `*_value` half is the row's sort column value; without it the cursor
/// compares ids only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub query: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub after_id: Option<QueryParam>,
    pub after_value: Option<QueryParam>,
    pub before_id: Option<QueryParam>,
    pub before_value: Option<QueryParam>,
    pub limit: u32,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            query: None,
            sort_by: None,
            sort_order: SortOrder::default(),
            after_id: None,
            after_value: None,
            before_id: None,
            before_value: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sorted_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(column.into());
        self.sort_order = order;
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.query = Some(text.into());
        self
    }

    pub fn after(mut self, id: impl Into<QueryParam>, value: Option<QueryParam>) -> Self {
        self.after_id = Some(id.into());
        self.after_value = value;
        self
    }

    pub fn before(mut self, id: impl Into<QueryParam>, value: Option<QueryParam>) -> Self {
        self.before_id = Some(id.into());
        self.before_value = value;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// The limit actually applied, clamped to `1..=MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }

    /// Parameters for the page following a page whose last row is given.
    pub fn next_page(&self, last_id: impl Into<QueryParam>, last_value: Option<QueryParam>) -> Self {
        let mut next = self.clone();
        next.before_id = None;
        next.before_value = None;
        next.after(last_id, last_value)
    }

    /// Parameters for the page preceding a page whose first row is given.
    pub fn previous_page(
        &self,
        first_id: impl Into<QueryParam>,
        first_value: Option<QueryParam>,
    ) -> Self {
        let mut previous = self.clone();
        previous.after_id = None;
        previous.after_value = None;
        previous.before(first_id, first_value)
    }
}

/// A `WHERE` predicate with its bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub predicate: String,
    pub args: Vec<QueryParam>,
}

/// The query a page is cut from.
///
/// `select` is everything up to (but excluding) the `WHERE` clause, e.g.
/// `SELECT id, typeId FROM objectType`. Filters are ANDed together with the
/// search and cursor predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseQuery {
    pub select: String,
    pub filters: Vec<Filter>,
}

impl BaseQuery {
    pub fn new(select: impl Into<String>) -> Self {
        Self {
            select: select.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, predicate: impl Into<String>, args: Vec<QueryParam>) -> Self {
        self.filters.push(Filter {
            predicate: predicate.into(),
            args,
        });
        self
    }
}

/// A built page query; `args` line up with the `?` placeholders in `sql`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    pub sql: String,
    pub args: Vec<QueryParam>,
}

/// Which columns a listing may be ordered and searched by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSpec {
    /// Unique tie-break column. Always sortable.
    pub id_column: String,
    pub search_column: Option<String>,
    pub sortable: Vec<String>,
}

impl ListSpec {
    pub fn new(id_column: impl Into<String>) -> Self {
        Self {
            id_column: id_column.into(),
            search_column: None,
            sortable: Vec::new(),
        }
    }

    pub fn searchable(mut self, column: impl Into<String>) -> Self {
        self.search_column = Some(column.into());
        self
    }

    pub fn sortable<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sortable.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Check every configured column name is a plain identifier.
    pub fn validate(&self) -> DbResult<()> {
        validate_identifier(&self.id_column)?;
        if let Some(column) = &self.search_column {
            validate_identifier(column)?;
        }
        self.sortable.iter().try_for_each(|c| validate_identifier(c))
    }

    fn sort_column<'a>(&'a self, params: &'a ListParams) -> DbResult<&'a str> {
        match params.sort_by.as_deref() {
            None => Ok(&self.id_column),
            Some(column) if column == self.id_column => Ok(column),
            Some(column) if self.sortable.iter().any(|c| c == column) => Ok(column),
            Some(column) => Err(DbError::invalid_input(format!(
                "Cannot sort by '{}'; sortable columns are: {}",
                column,
                self.allowed_sort_columns().join(", ")
            ))),
        }
    }

    fn allowed_sort_columns(&self) -> Vec<&str> {
        std::iter::once(self.id_column.as_str())
            .chain(self.sortable.iter().map(String::as_str))
            .collect()
    }

    /// Build the query for one page of `base` as described by `params`.
    pub fn build_page(&self, base: &BaseQuery, params: &ListParams) -> DbResult<PageQuery> {
        self.validate()?;
        let sort = self.sort_column(params)?;
        let id = self.id_column.as_str();
        let sort_is_id = sort == id;
        let order = params.sort_order;

        let mut predicates = Vec::new();
        let mut args = Vec::new();

        for filter in &base.filters {
            predicates.push(format!("({})", filter.predicate));
            args.extend(filter.args.iter().cloned());
        }

        if let Some(text) = params.query.as_deref().filter(|t| !t.is_empty()) {
            let column = self.search_column.as_deref().ok_or_else(|| {
                DbError::invalid_input("This listing does not support free-text search")
            })?;
            predicates.push(format!("{column} LIKE ? ESCAPE '!'"));
            args.push(QueryParam::String(format!("%{}%", escape_like(text))));
        }

        if let Some(after_id) = &params.after_id {
            let cursor = Cursor {
                id: after_id,
                value: params.after_value.as_ref().filter(|_| !sort_is_id),
            };
            cursor.push(sort, id, order.after_op(), &mut predicates, &mut args);
        }

        if let Some(before_id) = &params.before_id {
            let cursor = Cursor {
                id: before_id,
                value: params.before_value.as_ref().filter(|_| !sort_is_id),
            };
            cursor.push(sort, id, order.before_op(), &mut predicates, &mut args);
        }

        let mut sql = base.select.trim_end().to_string();
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        if sort_is_id {
            sql.push_str(&format!(" ORDER BY {id} {order}"));
        } else {
            sql.push_str(&format!(" ORDER BY {sort} {order}, {id} {order}"));
        }
        sql.push_str(" LIMIT ?");
        args.push(QueryParam::Int(i64::from(params.effective_limit())));

        Ok(PageQuery { sql, args })
    }
}

struct Cursor<'a> {
    id: &'a QueryParam,
    value: Option<&'a QueryParam>,
}

impl Cursor<'_> {
    fn push(
        &self,
        sort: &str,
        id: &str,
        op: &str,
        predicates: &mut Vec<String>,
        args: &mut Vec<QueryParam>,
    ) {
        match self.value {
            Some(value) => {
                predicates.push(format!("({sort} {op} ? OR ({sort} = ? AND {id} {op} ?))"));
                args.extend([value.clone(), value.clone(), self.id.clone()]);
            }
            None => {
                predicates.push(format!("{id} {op} ?"));
                args.push(self.id.clone());
            }
        }
    }
}

/// Escape `LIKE` wildcards for use with `ESCAPE '!'`.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '!' | '%' | '_') {
            escaped.push('!');
        }
        escaped.push(c);
    }
    escaped
}

/// Accept `name` or `schema.name` made of ASCII letters, digits and `_`.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            part.chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!("Invalid identifier '{name}'")))
    }
}
