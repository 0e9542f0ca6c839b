//! Wrapper turning a plain filter function into a filter class.

use super::*;

/// Filter class synthesized around a [`SimpleDefinition`].
///
/// The constructor parameters are the function's parameter table, one to one. Constructing
/// stores the arguments; running forwards them to the function together with the live entry
/// or document.
#[derive(Debug, Clone)]
pub struct SimpleFilterClass {
  /// Filter name
  name:       String,
  /// First line of the docstring
  help:       String,
  /// The wrapped function and its parameters
  definition: SimpleDefinition,
}

impl SimpleFilterClass {
  /// Wraps a definition under `name`.
  pub fn new(name: impl Into<String>, definition: SimpleDefinition) -> Self {
    let help = definition.docstring.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    Self { name: name.into(), help: help.to_string(), definition }
  }

  /// The processing mode of the wrapped function.
  pub fn action(&self) -> FilterAction { self.definition.function.action() }
}

impl FilterClass for SimpleFilterClass {
  fn name(&self) -> &str { &self.name }

  fn help(&self) -> &str { &self.help }

  fn docstring(&self) -> &str { &self.definition.docstring }

  fn signature(&self) -> Signature { Signature::new(self.definition.params.clone()) }

  fn construct(&self, args: FilterArgs) -> FilterResult<Box<dyn Filter>> {
    Ok(Box::new(SimpleFilter { function: self.definition.function.clone(), args }))
  }
}

/// Instance of a [`SimpleFilterClass`].
#[derive(Debug)]
pub struct SimpleFilter {
  /// The wrapped function
  function: SimpleFunction,
  /// Arguments it was constructed with
  args:     FilterArgs,
}

impl Filter for SimpleFilter {
  fn action(&self) -> FilterAction { self.function.action() }

  fn filter_entry(&mut self, entry: &mut Entry, _ctx: &mut FilterContext<'_>) -> FilterResult<()> {
    match &self.function {
      SimpleFunction::Entry(f) => f(entry, &self.args),
      SimpleFunction::Document(_) => Err(FilterError::Unsupported("entry")),
    }
  }

  fn filter_document(&mut self, document: &mut Document) -> FilterResult<()> {
    match &self.function {
      SimpleFunction::Document(f) => f(document, &self.args),
      SimpleFunction::Entry(_) => Err(FilterError::Unsupported("document")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn suffix_class() -> SimpleFilterClass {
    SimpleFilterClass::new("suffix", SimpleDefinition {
      function:  SimpleFunction::entry(|entry, args| {
        let suffix = args.get_str("suffix").unwrap_or_default();
        let title = entry.field("title").unwrap_or_default().to_string();
        entry.set_field("title", title + &suffix);
        Ok(())
      }),
      params:    vec![Param::optional("suffix", "-x")],
      docstring: "\n  Append a suffix to titles.\n\n  * suffix: appended text\n".to_string(),
    })
  }

  #[test]
  fn test_help_is_first_docstring_line() {
    assert_eq!(suffix_class().help(), "Append a suffix to titles.");
    assert_eq!(suffix_class().signature().params.len(), 1);
  }

  #[test]
  fn test_constructed_filter_forwards_arguments() {
    let class = suffix_class();
    let mut filter = class.construct(FilterArgs::new().with("suffix", "-zz")).unwrap();
    assert_eq!(filter.action(), FilterAction::Entry);

    let mut cache = RootCache::new("1");
    let accessors = BTreeMap::new();
    let mut ctx = FilterContext::new(Caches::new(&mut cache, &accessors), InterruptHandle::new());
    let mut entry = Entry::new("a", "article").with_field("title", "Alpha");
    filter.filter_entry(&mut entry, &mut ctx).unwrap();
    assert_eq!(entry.field("title"), Some("Alpha-zz"));

    assert!(matches!(
      filter.filter_bibliography(&mut Bibliography::new(), &mut ctx),
      Err(FilterError::Unsupported(_))
    ));
  }
}
