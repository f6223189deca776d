//! Query keys identifying one paginated, filtered view over a resource type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::entity::{value_text, Entity, FieldDelta, ResourceType};
use crate::lifecycle::LifecycleView;

/// One sort criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
  pub field: String,
  pub descending: bool,
}

impl SortField {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: false,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: true,
    }
  }
}

impl fmt::Display for SortField {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.descending {
      write!(f, "{}:desc", self.field)
    } else {
      write!(f, "{}:asc", self.field)
    }
  }
}

impl FromStr for SortField {
  type Err = String;

  /// Parses `field`, `field:asc` or `field:desc`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (field, dir) = match s.split_once(':') {
      Some((field, dir)) => (field.trim(), dir.trim().to_lowercase()),
      None => (s.trim(), "asc".to_string()),
    };
    if field.is_empty() {
      return Err(format!("empty sort field in '{}'", s));
    }
    match dir.as_str() {
      "asc" => Ok(Self::asc(field)),
      "desc" => Ok(Self::desc(field)),
      other => Err(format!("unknown sort direction '{}'", other)),
    }
  }
}

/// Parameters of one list view. Equal keys share one cache page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
  pub resource: ResourceType,
  /// 1-based page number
  pub page: u32,
  pub page_size: u32,
  pub view: LifecycleView,
  pub filters: BTreeMap<String, String>,
  pub sort: Vec<SortField>,
  pub search: Option<String>,
}

impl QueryKey {
  pub const DEFAULT_PAGE_SIZE: u32 = 20;

  /// First page of the default (active) view.
  pub fn new(resource: ResourceType) -> Self {
    Self {
      resource,
      page: 1,
      page_size: Self::DEFAULT_PAGE_SIZE,
      view: LifecycleView::Active,
      filters: BTreeMap::new(),
      sort: Vec::new(),
      search: None,
    }
  }

  pub fn with_page(mut self, page: u32) -> Self {
    self.page = page.max(1);
    self
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn with_view(mut self, view: LifecycleView) -> Self {
    self.view = view;
    self
  }

  pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.filters.insert(field.into(), value.into());
    self
  }

  pub fn with_sort(mut self, sort: SortField) -> Self {
    self.sort.push(sort);
    self
  }

  /// Set the search term. Blank terms clear it.
  pub fn with_search(mut self, term: impl AsRef<str>) -> Self {
    let term = term.as_ref().trim();
    self.search = if term.is_empty() {
      None
    } else {
      Some(term.to_string())
    };
    self
  }

  /// Zero-based offset of the first row of this page.
  pub fn offset(&self) -> u64 {
    u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
  }

  /// Unfiltered first-page view of the default ordering.
  pub fn is_plain_head(&self) -> bool {
    self.page == 1 && self.filters.is_empty() && self.search.is_none()
  }

  /// Key under which a bounded superset is cached in local fallback mode.
  pub fn superset(&self, cap: u32) -> QueryKey {
    QueryKey::new(self.resource)
      .with_view(self.view)
      .with_page_size(cap)
  }

  /// Whether a change to the delta's fields could alter which rows this key
  /// contains or their order.
  pub fn depends_on(&self, delta: &FieldDelta) -> bool {
    self.search.is_some()
      || delta
        .fields()
        .any(|f| self.filters.contains_key(f) || self.sort.iter().any(|s| s.field == f))
  }

  /// Whether an entity belongs in this view, judged on the client.
  pub fn matches(&self, entity: &Entity) -> bool {
    if entity.resource != self.resource || !self.view.admits(entity.state) {
      return false;
    }
    let filters_match = self
      .filters
      .iter()
      .all(|(field, wanted)| entity.field(field).map(value_text).as_deref() == Some(wanted.as_str()));
    if !filters_match {
      return false;
    }
    match &self.search {
      Some(term) => {
        let term = term.to_lowercase();
        entity
          .payload
          .values()
          .any(|v| value_text(v).to_lowercase().contains(&term))
      }
      None => true,
    }
  }

  /// Order two entities by this key's sort fields, falling back to id.
  pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
    for sort in &self.sort {
      let ord = compare_values(a.field(&sort.field), b.field(&sort.field));
      let ord = if sort.descending { ord.reverse() } else { ord };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    a.id.cmp(&b.id)
  }

  /// Stable digest for log correlation.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(&hasher.finalize()[..8])
  }

  pub fn description(&self) -> String {
    let mut desc = format!("{} page {} ({} per page)", self.resource, self.page, self.page_size);
    match self.view {
      LifecycleView::Active => {}
      LifecycleView::Trashed => desc.push_str(", trash"),
      LifecycleView::All => desc.push_str(", all states"),
    }
    for (field, value) in &self.filters {
      desc.push_str(&format!(", {}={}", field, value));
    }
    if !self.sort.is_empty() {
      let sort: Vec<String> = self.sort.iter().map(ToString::to_string).collect();
      desc.push_str(&format!(", sorted by {}", sort.join(",")));
    }
    if let Some(term) = &self.search {
      desc.push_str(&format!(", search '{}'", term));
    }
    desc
  }

  fn canonical(&self) -> String {
    let filters: Vec<String> = self.filters.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let sort: Vec<String> = self.sort.iter().map(ToString::to_string).collect();
    format!(
      "{}|{}|{}|{:?}|{}|{}|{}",
      self.resource,
      self.page,
      self.page_size,
      self.view,
      filters.join("&"),
      sort.join(","),
      self.search.as_deref().unwrap_or("")
    )
  }
}

/// Missing values sort first, numbers numerically, everything else as text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (None, None) => Ordering::Equal,
    (None, Some(_)) => Ordering::Less,
    (Some(_), None) => Ordering::Greater,
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(x), Some(y)) => value_text(x).cmp(&value_text(y)),
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}
