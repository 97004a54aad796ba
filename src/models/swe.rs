use serde::{Deserialize, Serialize};

/// A record-structure tree describing one output of a system.
///
/// Strict equality is plain `==`. Structural compatibility relaxes units
/// and labels but keeps tree shape, field names and leaf kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataComponent {
    Record {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        fields: Vec<Field>,
    },
    Vector {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        coordinates: Vec<Field>,
    },
    Quantity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        unit: String,
    },
    Count {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Time {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub component: DataComponent,
}

impl DataComponent {
    /// Same tree shape, field names and leaf kinds; units and labels may
    /// differ.
    pub fn compatible_with(&self, other: &DataComponent) -> bool {
        use DataComponent::*;
        match (self, other) {
            (Record { fields: a, .. }, Record { fields: b, .. })
            | (Vector { coordinates: a, .. }, Vector { coordinates: b, .. }) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(fa, fb)| fa.name == fb.name && fa.component.compatible_with(&fb.component))
            }
            (Quantity { .. }, Quantity { .. }) => true,
            (Count { .. }, Count { .. }) => true,
            (Text { .. }, Text { .. }) => true,
            (Boolean { .. }, Boolean { .. }) => true,
            (Time { .. }, Time { .. }) => true,
            _ => false,
        }
    }

    /// Name of the first top-level `Time` field, used to extract phenomenon
    /// time from incoming records.
    pub fn time_field(&self) -> Option<&str> {
        match self {
            DataComponent::Record { fields, .. } => fields
                .iter()
                .find(|f| matches!(f.component, DataComponent::Time { .. }))
                .map(|f| f.name.as_str()),
            _ => None,
        }
    }
}
