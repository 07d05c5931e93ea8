//! Dialect-neutral row cells for copying rows between stores.

use sqlx::any::{Any, AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Decode, Row, Type, ValueRef};

/// Read a column that may hold NULL.
///
/// The `Any` driver refuses to decode a NULL cell into `Option<T>`, so the
/// raw value is inspected before the typed decode.
pub fn try_get_nullable<'r, T>(row: &'r AnyRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: Decode<'r, Any> + Type<Any>,
{
    if row.try_get_raw(column)?.is_null() {
        return Ok(None);
    }
    row.try_get(column).map(Some)
}

/// Declared storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    /// Short, indexable text.
    Text,
    /// Unbounded text (JSON documents, messages).
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    pub fn decode(row: &AnyRow, column: &str, ty: ColumnType) -> Result<Self, sqlx::Error> {
        Ok(match ty {
            ColumnType::Int => try_get_nullable::<i64>(row, column)?.map_or(Self::Null, Self::Int),
            ColumnType::Text | ColumnType::Body => {
                try_get_nullable::<String>(row, column)?.map_or(Self::Null, Self::Text)
            }
        })
    }

    /// Bind onto a query; NULLs carry the column's type.
    pub fn bind<'q>(
        self,
        query: Query<'q, Any, AnyArguments<'q>>,
        ty: ColumnType,
    ) -> Query<'q, Any, AnyArguments<'q>> {
        match (self, ty) {
            (Self::Int(v), _) => query.bind(v),
            (Self::Text(v), _) => query.bind(v),
            (Self::Null, ColumnType::Int) => query.bind(None::<i64>),
            (Self::Null, ColumnType::Text | ColumnType::Body) => query.bind(None::<String>),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Null | Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            Self::Null | Self::Int(_) => None,
        }
    }
}
