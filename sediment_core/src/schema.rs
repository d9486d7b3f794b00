//! Schema value objects: tables, columns, indexes and foreign keys.
//!
//! These types describe *what* a table should look like. They carry no
//! dialect knowledge; backends render them into their own DDL.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The logical type of a column.
///
/// Backends map each variant onto the closest native type of their dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// 16-bit integer.
    SmallInteger,
    /// Boolean flag.
    Boolean,
    /// Unbounded text.
    Text,
    /// Variable length string with a maximum length.
    String(u32),
    /// Fixed point number.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
    /// Double precision floating point.
    Float,
    /// Calendar date.
    Date,
    /// Point in time.
    Timestamp,
    /// JSON document.
    Json,
    /// UUID value.
    Uuid,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether NULL is allowed. Columns are NOT NULL unless stated otherwise.
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    /// Whether this column alone is the primary key.
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    /// Whether the database generates values for this column.
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
    /// Whether values must be unique.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Default value, as a raw SQL expression (`0`, `'draft'`, `CURRENT_TIMESTAMP`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ColumnDef {
    /// Creates a NOT NULL column of the given type.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
        }
    }

    /// Allows NULL values.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the column as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the column as database generated.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Adds a uniqueness constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the default value expression.
    pub fn default_sql(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }
}

/// What happens to referencing rows when the referenced row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    /// Propagate the change.
    Cascade,
    /// Set the referencing columns to NULL.
    SetNull,
    /// Reject the change.
    Restrict,
    /// Defer to the engine's default check.
    NoAction,
}

impl ReferentialAction {
    /// SQL keyword for this action.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// A foreign key constraint declared with a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references: String,
    /// Referenced columns.
    pub referenced_columns: Vec<String>,
    /// Action on delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
    /// Action on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ReferentialAction>,
}

impl ForeignKey {
    /// Single column foreign key.
    pub fn new(
        column: impl Into<String>,
        references: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            columns: vec![column.into()],
            references: references.into(),
            referenced_columns: vec![referenced_column.into()],
            on_delete: None,
            on_update: None,
        }
    }

    /// Sets the ON DELETE action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    /// Sets the ON UPDATE action.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = Some(action);
        self
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Composite primary key. Empty when a column carries `primary_key` or
    /// when the table has no primary key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    /// Foreign key constraints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    /// Creates an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Appends a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Declares a composite primary key.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a foreign key.
    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Names of the declared columns.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// An index over one or more columns of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl IndexDef {
    /// Creates a non-unique index.
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Introspected shape of a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    /// Column names.
    pub columns: BTreeSet<String>,
    /// Index names.
    pub indexes: BTreeSet<String>,
}

/// The introspectable state of a database schema at one point in time.
///
/// Snapshots are computed on demand and never cached: the schema may change
/// between runs, including out-of-band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    /// Tables keyed by name.
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl SchemaSnapshot {
    /// Whether the snapshot contains `table`.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Whether `table` has `column`.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.columns.contains(column))
    }

    /// Whether `table` has an index called `index`.
    pub fn has_index(&self, table: &str, index: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.indexes.contains(index))
    }

    /// The same snapshot without the given tables (used to hide the ledger).
    pub fn without_tables<'a>(mut self, tables: impl IntoIterator<Item = &'a str>) -> Self {
        for table in tables {
            self.tables.remove(table);
        }
        self
    }
}
