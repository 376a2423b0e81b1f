use crate::SourceKind;

/// How a [crate::CameraImage] is interpreted by detection.
///
/// The variant fixes both the number of regions of interest and the number
/// and order of result slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcMode {
    #[default]
    Undetermined,
    SingleImageOnePupil,
    SingleImageTwoPupil,
    StereoImageOnePupil,
    StereoImageTwoPupil,
}

impl ProcMode {
    /// Number of pupil slots in every emitted result vector.
    pub fn slot_count(&self) -> usize {
        match self {
            ProcMode::Undetermined => 0,
            ProcMode::SingleImageOnePupil => 1,
            ProcMode::SingleImageTwoPupil => 2,
            ProcMode::StereoImageOnePupil => 2,
            ProcMode::StereoImageTwoPupil => 4,
        }
    }

    /// Number of regions of interest the mode declares.
    pub fn roi_count(&self) -> usize {
        self.slot_count()
    }

    /// Fixed result slot labels, also used for CSV column prefixes.
    pub fn slot_labels(&self) -> &'static [&'static str] {
        match self {
            ProcMode::Undetermined => &[],
            ProcMode::SingleImageOnePupil => &["main"],
            ProcMode::SingleImageTwoPupil => &["pupil_a", "pupil_b"],
            ProcMode::StereoImageOnePupil => &["view1", "view2"],
            ProcMode::StereoImageTwoPupil => {
                &["pupil_a_view1", "pupil_a_view2", "pupil_b_view1", "pupil_b_view2"]
            }
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(
            self,
            ProcMode::StereoImageOnePupil | ProcMode::StereoImageTwoPupil
        )
    }

    /// Whether this mode can process frames of the given source kind.
    ///
    /// `Undetermined` is compatible with nothing; selecting it is the unset
    /// state, not a processable mode.
    pub fn compatible_with(&self, kind: SourceKind) -> bool {
        match self {
            ProcMode::Undetermined => false,
            ProcMode::SingleImageOnePupil | ProcMode::SingleImageTwoPupil => !kind.is_stereo(),
            ProcMode::StereoImageOnePupil | ProcMode::StereoImageTwoPupil => kind.is_stereo(),
        }
    }
}
