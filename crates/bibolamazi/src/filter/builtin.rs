//! The filter package shipped with the engine.

use chrono::format::{Item, StrftimeItems};

use super::*;

/// Name of the built-in filter package.
pub const BUILTIN_PACKAGE: &str = "bibolamazi_filters";

/// The built-in package: `strip`, `fieldset` and `firstseen`.
pub fn builtin_package() -> StaticFilterPackage {
  StaticFilterPackage::new(BUILTIN_PACKAGE)
    .with_module("strip", strip_module())
    .with_module("fieldset", FilterModule::with_class(Arc::new(FieldSetClass)))
    .with_module("firstseen", FilterModule::with_class(Arc::new(FirstSeenClass)))
}

/// Docstring of `strip`.
const STRIP_DOC: &str = "Remove fields from every entry.

  * fields (list): Comma-separated names of the fields to remove.
  * entry_types (list): Only strip entries of these types. All types when empty.
";

/// `strip`: a plain per-entry function removing fields.
pub fn strip_module() -> FilterModule {
  FilterModule::with_function(
    SimpleFunction::entry(strip_entry),
    vec![Param::optional("fields", "note,annote"), Param::optional("entry_types", "")],
    STRIP_DOC,
  )
}

/// Removes the configured fields from one entry.
fn strip_entry(entry: &mut Entry, args: &FilterArgs) -> FilterResult<()> {
  let types = args.get_list("entry_types").unwrap_or_default();
  if !types.is_empty() && !types.iter().any(|t| t.eq_ignore_ascii_case(&entry.entry_type)) {
    return Ok(());
  }
  for field in args.get_list("fields").unwrap_or_default() {
    entry.remove_field(&field);
  }
  Ok(())
}

/// Class of `fieldset`.
#[derive(Debug, Clone, Copy)]
pub struct FieldSetClass;

impl FilterClass for FieldSetClass {
  fn name(&self) -> &str { "fieldset" }

  fn help(&self) -> &str { "Set a field to a fixed value on every entry." }

  fn docstring(&self) -> &str {
    "Set a field to a fixed value on every entry.

  * field: Name of the field to set.
  * value: Value to store.
  * overwrite (bool): Replace values already present.
"
  }

  fn signature(&self) -> Signature {
    Signature::new(vec![
      Param::required("field"),
      Param::required("value"),
      Param::optional("overwrite", true),
    ])
  }

  fn construct(&self, args: FilterArgs) -> FilterResult<Box<dyn Filter>> {
    let field = args.get_str("field").unwrap_or_default();
    if field.trim().is_empty() {
      return Err(FilterError::failed("field name must not be empty"));
    }
    Ok(Box::new(FieldSet {
      field,
      value: args.get_str("value").unwrap_or_default(),
      overwrite: args.get_bool("overwrite").unwrap_or(true),
    }))
  }
}

/// The `fieldset` filter.
#[derive(Debug)]
pub struct FieldSet {
  /// Field name
  field:     String,
  /// Value to set
  value:     String,
  /// Replace existing values
  overwrite: bool,
}

impl Filter for FieldSet {
  fn action(&self) -> FilterAction { FilterAction::Entry }

  fn filter_entry(&mut self, entry: &mut Entry, _ctx: &mut FilterContext<'_>) -> FilterResult<()> {
    if self.overwrite || entry.field(&self.field).is_none() {
      entry.set_field(self.field.clone(), self.value.clone());
    }
    Ok(())
  }
}

/// Name of the sub-cache `firstseen` keeps its dates in.
pub const FIRSTSEEN_CACHE: &str = "firstseen";

/// Class of `firstseen`.
#[derive(Debug, Clone, Copy)]
pub struct FirstSeenClass;

impl FilterClass for FirstSeenClass {
  fn name(&self) -> &str { "firstseen" }

  fn help(&self) -> &str { "Record the date each citation key was first seen." }

  fn docstring(&self) -> &str {
    "Record the date each citation key was first seen.

Dates are remembered in the document cache and expire with it.

  * field: Field receiving the date.
  * format: strftime-style date format.
"
  }

  fn signature(&self) -> Signature {
    Signature::new(vec![Param::optional("field", "firstseen"), Param::optional("format", "%Y-%m-%d")])
  }

  fn construct(&self, args: FilterArgs) -> FilterResult<Box<dyn Filter>> {
    let format = args.get_str("format").unwrap_or_else(|| "%Y-%m-%d".to_string());
    if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
      return Err(FilterError::failed(format!("invalid date format `{format}`")));
    }
    Ok(Box::new(FirstSeen {
      field: args.get_str("field").unwrap_or_else(|| "firstseen".to_string()),
      format,
    }))
  }
}

/// The `firstseen` filter.
#[derive(Debug)]
pub struct FirstSeen {
  /// Field receiving the date
  field:  String,
  /// Date format
  format: String,
}

impl Filter for FirstSeen {
  fn action(&self) -> FilterAction { FilterAction::Entry }

  fn cache_accessors(&self) -> Vec<CacheAccessorSpec> {
    vec![CacheAccessorSpec::expiring(FIRSTSEEN_CACHE)]
  }

  fn filter_entry(&mut self, entry: &mut Entry, ctx: &mut FilterContext<'_>) -> FilterResult<()> {
    let mut cache = ctx.caches.open(FIRSTSEEN_CACHE).map_err(FilterError::other)?;
    let seen = match cache.get_str(&entry.key).map_err(FilterError::other)? {
      Some(seen) => seen,
      None => {
        let today = Utc::now().format(&self.format).to_string();
        cache.set(&entry.key, today.clone()).map_err(FilterError::other)?;
        today
      },
    };
    entry.set_field(self.field.clone(), seen);
    Ok(())
  }
}
