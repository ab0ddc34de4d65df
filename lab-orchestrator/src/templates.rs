use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use lab_core::LabTemplate;

/// Templates known to the running engine, keyed by id.
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, LabTemplate>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = LabTemplate>) -> Self {
        let catalog = Self::new();
        catalog.replace_all(templates);
        catalog
    }

    /// Insert or replace; returns the template previously stored under the id.
    pub fn insert(&self, template: LabTemplate) -> Option<LabTemplate> {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template.id.clone(), template)
    }

    /// Swap the whole catalog, e.g. after re-reading the templates directory.
    pub fn replace_all(&self, templates: impl IntoIterator<Item = LabTemplate>) {
        let fresh: HashMap<_, _> = templates.into_iter().map(|t| (t.id.clone(), t)).collect();
        *self.templates.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    pub fn get(&self, id: &str) -> Option<LabTemplate> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<LabTemplate> {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// All templates sorted by id.
    pub fn list(&self) -> Vec<LabTemplate> {
        let mut templates: Vec<_> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn len(&self) -> usize {
        self.templates.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_all_drops_stale_templates() {
        let catalog = TemplateCatalog::from_templates(vec![
            LabTemplate::new("b", "B", "1h", vec![]),
            LabTemplate::new("a", "A", "1h", vec![]),
        ]);
        assert_eq!(
            catalog.list().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        catalog.replace_all(vec![LabTemplate::new("c", "C", "2h", vec![])]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("a").is_none());
        assert!(catalog.get("c").is_some());
    }
}
