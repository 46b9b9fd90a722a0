use serde::{Deserialize, Serialize};

use crate::types::PixelClassMap;

/// Label reported for IDs outside the diagnosis table.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Periodontal findings, in class-ID order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisClass {
    Healthy = 0,
    MildGingivitis = 1,
    ModerateGingivitis = 2,
    SevereGingivitis = 3,
    Plaque = 4,
    Tartar = 5,
    Other = 6,
}

impl DiagnosisClass {
    pub const ALL: [DiagnosisClass; 7] = [
        Self::Healthy,
        Self::MildGingivitis,
        Self::ModerateGingivitis,
        Self::SevereGingivitis,
        Self::Plaque,
        Self::Tartar,
        Self::Other,
    ];

    pub fn from_id(class_id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(class_id)).copied()
    }

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::MildGingivitis => "Mild Gingivitis",
            Self::ModerateGingivitis => "Moderate Gingivitis",
            Self::SevereGingivitis => "Severe Gingivitis",
            Self::Plaque => "Plaque",
            Self::Tartar => "Tartar",
            Self::Other => "Other",
        }
    }
}

/// The single dominant finding of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisLabel {
    pub class_id: u8,
    pub label: String,
}

impl DiagnosisLabel {
    /// Looks an ID up in the static table; unknown IDs get [`UNKNOWN_LABEL`].
    pub fn from_class_id(class_id: u8) -> Self {
        let label = DiagnosisClass::from_id(class_id)
            .map(DiagnosisClass::label)
            .unwrap_or(UNKNOWN_LABEL);
        Self {
            class_id,
            label: label.to_string(),
        }
    }

    pub fn class(&self) -> Option<DiagnosisClass> {
        DiagnosisClass::from_id(self.class_id)
    }
}

/// Pixel count per class ID.
pub fn class_histogram(map: &PixelClassMap) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &class_id in map.iter() {
        counts[usize::from(class_id)] += 1;
    }
    counts
}

/// Majority vote over all pixels.
///
/// IDs are scanned in ascending order and only a strictly larger count
/// replaces the current winner, so ties go to the lowest ID. An empty map
/// is Healthy.
pub fn reduce(map: &PixelClassMap) -> DiagnosisLabel {
    let counts = class_histogram(map);
    let mut winner = 0u8;
    let mut best = 0usize;
    for (class_id, &count) in counts.iter().enumerate() {
        if count > best {
            winner = class_id as u8;
            best = count;
        }
    }
    DiagnosisLabel::from_class_id(winner)
}
