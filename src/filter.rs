//! Pagination descriptor: offset, page size, sorting, named parameters and
//! an optional example entity driving filter restrictions.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::metamodel::Entity;

/// Sort direction of a filter field; `Unsorted` defers to the default
/// (ascending).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sort {
    Ascending,
    Descending,
    #[default]
    Unsorted,
}

impl Sort {
    pub fn is_ascending(self) -> bool {
        self == Sort::Ascending
    }
}

/// One field of a multi-field sort; list order decides sort precedence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiSort {
    pub sort: Sort,
    pub field: String,
}

impl MultiSort {
    pub fn new(sort: Sort, field: impl Into<String>) -> Self {
        Self {
            sort,
            field: field.into(),
        }
    }
}

/// Database pagination metadata for one listing call.
#[derive(Clone, Debug)]
pub struct Filter<T: Entity> {
    example: Option<T>,
    first: i64,
    page_size: i64,
    sort_field: Option<String>,
    sort: Sort,
    multi_sort: Vec<MultiSort>,
    params: HashMap<String, Value>,
}

impl<T: Entity> Default for Filter<T> {
    fn default() -> Self {
        Self {
            example: None,
            first: 0,
            page_size: 0,
            sort_field: None,
            sort: Sort::Unsorted,
            multi_sort: Vec::new(),
            params: HashMap::new(),
        }
    }
}

impl<T: Entity> Filter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter whose restrictions derive from an example entity.
    pub fn of(example: T) -> Self {
        Self {
            example: Some(example),
            ..Self::default()
        }
    }

    pub fn example(&self) -> Option<&T> {
        self.example.as_ref()
    }

    pub fn set_example(mut self, example: T) -> Self {
        self.example = Some(example);
        self
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn set_first(mut self, first: i64) -> Self {
        self.first = first.max(0);
        self
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    pub fn set_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(0);
        self
    }

    pub fn sort_field(&self) -> Option<&str> {
        self.sort_field.as_deref()
    }

    pub fn set_sort_field(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }

    pub fn sort(&self) -> Sort {
        self.sort
    }

    pub fn set_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn multi_sort(&self) -> &[MultiSort] {
        &self.multi_sort
    }

    /// Appends a sort field; earlier entries are primary sort keys.
    pub fn add_multi_sort(mut self, sort: Sort, field: impl Into<String>) -> Self {
        let entry = MultiSort::new(sort, field);
        if !self.multi_sort.iter().any(|m| m.field == entry.field) {
            self.multi_sort.push(entry);
        }
        self
    }

    pub fn add_param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(key.into(), value);
        self
    }

    pub fn has_param(&self, key: &str) -> bool {
        matches!(self.params.get(key), Some(v) if !v.is_null())
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub fn string_param(&self, key: &str) -> Option<String> {
        self.param(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn int_param(&self, key: &str) -> Option<i32> {
        self.i64_param(key).map(|v| v as i32)
    }

    pub fn i64_param(&self, key: &str) -> Option<i64> {
        self.param(key).and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_i64(),
        })
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_bool(),
        })
    }

    pub fn double_param(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        })
    }
}
