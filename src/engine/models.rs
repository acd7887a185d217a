/// Ordered models tried left-to-right on every attempt: active, fallback,
/// then the stable model. Built once per run; duplicates and empty names
/// are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSequence {
    models: Vec<String>,
}

impl ModelSequence {
    pub fn new(active: &str, fallback: &str, stable: Option<&str>) -> Self {
        let mut models: Vec<String> = Vec::with_capacity(3);
        for name in [Some(active), Some(fallback), stable].into_iter().flatten() {
            let name = name.trim();
            if !name.is_empty() && !models.iter().any(|m| m == name) {
                models.push(name.to_string());
            }
        }
        Self { models }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// The slice an attempt walks: from `active` to the end. An unknown
    /// `active` walks the whole list.
    pub fn starting_at(&self, active: &str) -> &[String] {
        let start = self.models.iter().position(|m| m == active).unwrap_or(0);
        &self.models[start..]
    }

    /// Model after `current` in the full list, used as the new fallback
    /// once `current` becomes active.
    pub fn after(&self, current: &str) -> Option<&str> {
        let pos = self.models.iter().position(|m| m == current)?;
        self.models.get(pos + 1).map(String::as_str)
    }
}
