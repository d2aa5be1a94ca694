#[derive(Debug, Clone)]
pub struct TelemetryLabels {
    pub component: String,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            extra: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(1 + self.extra.len());
        tags.push(("component".into(), self.component.clone()));
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_start_with_component() {
        let labels = TelemetryLabels::new("session")
            .with("from", "idle")
            .with("to", "pairing");
        assert_eq!(
            labels.tags(),
            vec![
                ("component".to_string(), "session".to_string()),
                ("from".to_string(), "idle".to_string()),
                ("to".to_string(), "pairing".to_string()),
            ]
        );
    }
}
