use super::CellType;

/// A column of a shard table.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnDef {
    pub id: u32,
    pub name: String,
    pub column_type: CellType,
    /// Position within the primary key, None for value columns.
    #[serde(default)]
    pub key_order: Option<u32>,
}

/// The schema of one table as a shard sees it, including its version.
/// Schema versions advance on every DDL; readers pin the version they
/// resolved and are rejected when the shard has moved on.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub version: u64,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>, version: u64) -> Self {
        Self { columns, version }
    }

    pub fn column(&self, id: u32) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Key columns in key order.
    pub fn key_columns(&self) -> Vec<&ColumnDef> {
        let mut keys: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.key_order.is_some()).collect();
        keys.sort_by_key(|c| c.key_order);
        keys
    }

    pub fn key_types(&self) -> Vec<CellType> {
        self.key_columns().iter().map(|c| c.column_type).collect()
    }

    pub fn pk_arity(&self) -> usize {
        self.columns.iter().filter(|c| c.key_order.is_some()).count()
    }
}

/// Builds the canonical three-`Uint32`-key test table used across shard tests.
pub fn test_schema(version: u64) -> TableSchema {
    TableSchema::new(
        vec![
            ColumnDef { id: 1, name: "key1".into(), column_type: CellType::Uint32, key_order: Some(0) },
            ColumnDef { id: 2, name: "key2".into(), column_type: CellType::Uint32, key_order: Some(1) },
            ColumnDef { id: 3, name: "key3".into(), column_type: CellType::Uint32, key_order: Some(2) },
            ColumnDef { id: 4, name: "value".into(), column_type: CellType::Uint32, key_order: None },
        ],
        version,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_columns_follow_key_order() {
        let schema = test_schema(1);
        let names: Vec<&str> = schema.key_columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["key1", "key2", "key3"]);
        assert_eq!(schema.pk_arity(), 3);
        assert_eq!(schema.column(4).unwrap().name, "value");
        assert!(schema.column(9).is_none());
    }
}
