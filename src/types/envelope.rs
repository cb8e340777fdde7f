//! Response envelope and the declared capability manifest

use crate::types::record::THRESHOLD_FIELD;
use serde::{Deserialize, Deserializer, Serialize};

/// Multipart field carrying the volume bytes
pub const INPUT_FIELD: &str = "input";

/// Type tag of a response element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    LabelVolume,
    PlainText,
}

/// One typed element of the response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub content: String,
}

/// Ordered response: the encoded label volume followed by the inference time.
///
/// Built by [`Envelope::new`] or deserialized through [`Envelope::try_from`],
/// both of which guarantee exactly those two elements in that order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Envelope(Vec<ResponseElement>);

impl TryFrom<Vec<ResponseElement>> for Envelope {
    type Error = String;

    fn try_from(elements: Vec<ResponseElement>) -> Result<Self, Self::Error> {
        let kinds: Vec<ElementKind> = elements.iter().map(|e| e.kind).collect();
        if kinds != [ElementKind::LabelVolume, ElementKind::PlainText] {
            return Err(format!(
                "expected [LabelVolume, PlainText] elements, found {kinds:?}"
            ));
        }
        Ok(Self(elements))
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elements = Vec::<ResponseElement>::deserialize(deserializer)?;
        Self::try_from(elements).map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    pub fn new(label_volume_base64: String, elapsed_seconds: f64) -> Self {
        Self(vec![
            ResponseElement {
                kind: ElementKind::LabelVolume,
                content: label_volume_base64,
            },
            ResponseElement {
                kind: ElementKind::PlainText,
                content: elapsed_seconds.to_string(),
            },
        ])
    }

    pub fn elements(&self) -> &[ResponseElement] {
        &self.0
    }

    pub fn label_volume(&self) -> &str {
        &self.0[0].content
    }

    pub fn elapsed_time(&self) -> &str {
        &self.0[1].content
    }
}

/// Input widget advertised to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Widget {
    Volume {
        destination: String,
    },
    Slider {
        destination: String,
        minimum: f64,
        maximum: f64,
    },
}

/// What the service accepts and what it returns. Must track the record's
/// request fields and the envelope layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityManifest {
    pub inputs: Vec<Widget>,
    pub outputs: Vec<ElementKind>,
}

impl CapabilityManifest {
    pub fn segmentation() -> Self {
        Self {
            inputs: vec![
                Widget::Volume {
                    destination: INPUT_FIELD.to_string(),
                },
                Widget::Slider {
                    destination: THRESHOLD_FIELD.to_string(),
                    minimum: 0.0,
                    maximum: 1.0,
                },
            ],
            outputs: vec![ElementKind::LabelVolume, ElementKind::PlainText],
        }
    }
}
