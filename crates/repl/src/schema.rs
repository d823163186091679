//! Watched-table schema projection.

use std::sync::Arc;

use crate::field::Field;

/// Column names a collection selects out of the watched table.
#[derive(Debug, Clone, Default)]
pub struct SelectedFields {
    index_fields: Vec<String>,
    forward_fields: Vec<String>,
}

impl SelectedFields {
    /// Selection from a collection config.
    pub fn new(index_fields: Vec<String>, forward_fields: Vec<String>) -> Self {
        SelectedFields {
            index_fields,
            forward_fields,
        }
    }

    /// Index column names.
    pub fn index_fields(&self) -> &[String] {
        &self.index_fields
    }

    /// Forward column names.
    pub fn forward_fields(&self) -> &[String] {
        &self.forward_fields
    }

    /// Selected as an index column.
    pub fn is_index(&self, name: &str) -> bool {
        self.index_fields.iter().any(|f| f == name)
    }

    /// Selected as a forward column.
    pub fn is_forward(&self, name: &str) -> bool {
        self.forward_fields.iter().any(|f| f == name)
    }

    /// Selected at all.
    pub fn is_selected(&self, name: &str) -> bool {
        self.is_index(name) || self.is_forward(name)
    }

    /// Total selected columns.
    pub fn len(&self) -> usize {
        self.index_fields.len() + self.forward_fields.len()
    }

    /// True when nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded schema of the watched table.
///
/// `fields` follows the table's column order; the selected id lists index
/// into it. `selected_fields` orders index columns before forward columns,
/// which is also the scan-mode SELECT list order.
#[derive(Debug, Default)]
pub struct TableSchema {
    fields: Vec<Arc<Field>>,
    selected_fields: Vec<Arc<Field>>,
    selected_index_ids: Vec<usize>,
    selected_forward_ids: Vec<usize>,
    auto_increment_id: usize,
}

impl TableSchema {
    /// Assemble a schema; `fields` in table column order.
    pub fn new(fields: Vec<Arc<Field>>, auto_increment_id: usize) -> Self {
        let mut selected_index_ids = Vec::new();
        let mut selected_forward_ids = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if field.is_index() {
                selected_index_ids.push(i);
            }
            if field.is_forward() {
                selected_forward_ids.push(i);
            }
        }
        let mut selected_fields = Vec::with_capacity(selected_index_ids.len() + selected_forward_ids.len());
        for &i in &selected_index_ids {
            selected_fields.push(fields[i].clone());
        }
        for &i in &selected_forward_ids {
            selected_fields.push(fields[i].clone());
        }
        TableSchema {
            fields,
            selected_fields,
            selected_index_ids,
            selected_forward_ids,
            auto_increment_id,
        }
    }

    /// All table columns.
    pub fn fields(&self) -> &[Arc<Field>] {
        &self.fields
    }

    /// Selected columns, index columns first.
    pub fn selected_fields(&self) -> &[Arc<Field>] {
        &self.selected_fields
    }

    /// Positions of the selected index columns within `fields`.
    pub fn selected_index_ids(&self) -> &[usize] {
        &self.selected_index_ids
    }

    /// Positions of the selected forward columns within `fields`.
    pub fn selected_forward_ids(&self) -> &[usize] {
        &self.selected_forward_ids
    }

    /// Number of selected index columns (they lead the scan SELECT list).
    pub fn max_index_id(&self) -> usize {
        self.selected_index_ids.len()
    }

    /// Position of the auto-increment (primary key) column.
    pub fn auto_increment_id(&self) -> usize {
        self.auto_increment_id
    }

    /// The auto-increment column itself.
    pub fn auto_increment_field(&self) -> &Arc<Field> {
        &self.fields[self.auto_increment_id]
    }
}
