use pupil_types::{Pupil, PupilFrame};

use crate::{Error, Result};

/// One entry of the fixed streaming field menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamField {
    Trial,
    Timestamp,
    Filename,
    /// expands to `center_x;center_y`
    Center,
    MajorAxis,
    MinorAxis,
    Confidence,
    OutlineConfidence,
    Diameter,
    UndistortedDiameter,
    PhysicalDiameter,
}

impl StreamField {
    fn parse(token: &str) -> Result<Self> {
        Ok(match token {
            "trial" => StreamField::Trial,
            "timestamp" | "timestamp_ms" => StreamField::Timestamp,
            "filename" => StreamField::Filename,
            "center" => StreamField::Center,
            "major" => StreamField::MajorAxis,
            "minor" => StreamField::MinorAxis,
            "confidence" => StreamField::Confidence,
            "outline_confidence" => StreamField::OutlineConfidence,
            "diameter" => StreamField::Diameter,
            "undistorted_diameter" => StreamField::UndistortedDiameter,
            "physical_diameter" | "physical_diameter_mm" => StreamField::PhysicalDiameter,
            other => return Err(Error::UnknownField(other.to_string())),
        })
    }

    /// Record-level fields appear once; the rest repeat per pupil slot.
    fn is_per_pupil(&self) -> bool {
        !matches!(
            self,
            StreamField::Trial | StreamField::Timestamp | StreamField::Filename
        )
    }

    fn push_pupil_tokens(&self, pupil: &Pupil, out: &mut Vec<String>) {
        match self {
            StreamField::Center => {
                out.push(pupil.center_x.to_string());
                out.push(pupil.center_y.to_string());
            }
            StreamField::MajorAxis => out.push(pupil.major_axis().to_string()),
            StreamField::MinorAxis => out.push(pupil.minor_axis().to_string()),
            StreamField::Confidence => out.push(pupil.confidence.to_string()),
            StreamField::OutlineConfidence => out.push(pupil.outline_confidence.to_string()),
            StreamField::Diameter => out.push(pupil.diameter().to_string()),
            StreamField::UndistortedDiameter => out.push(
                pupil
                    .undistorted_diameter_px
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            StreamField::PhysicalDiameter => out.push(
                pupil
                    .physical_diameter_mm
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            _ => {}
        }
    }
}

/// Ordered field selection for one stream transport.
///
/// Record-level fields are emitted once in template order; per-pupil fields
/// are then repeated for every result slot, also in template order. Fields
/// are separated by `;`, lines terminated by `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTemplate {
    fields: Vec<StreamField>,
}

impl FieldTemplate {
    pub fn new(fields: Vec<StreamField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::EmptyTemplate);
        }
        Ok(Self { fields })
    }

    /// Parse a `;`-separated template such as
    /// `trial;timestamp;center;diameter;confidence`.
    pub fn parse(template: &str) -> Result<Self> {
        let fields = template
            .split(';')
            .filter(|t| !t.is_empty())
            .map(StreamField::parse)
            .collect::<Result<Vec<_>>>()?;
        Self::new(fields)
    }

    /// Every menu field, in the canonical order.
    pub fn full() -> Self {
        Self {
            fields: vec![
                StreamField::Trial,
                StreamField::Timestamp,
                StreamField::Filename,
                StreamField::Center,
                StreamField::MajorAxis,
                StreamField::MinorAxis,
                StreamField::Confidence,
                StreamField::OutlineConfidence,
                StreamField::Diameter,
                StreamField::UndistortedDiameter,
                StreamField::PhysicalDiameter,
            ],
        }
    }

    pub fn format_line(&self, frame: &PupilFrame) -> String {
        let mut tokens: Vec<String> = Vec::new();
        for field in &self.fields {
            match field {
                StreamField::Trial => tokens.push(frame.trial.to_string()),
                StreamField::Timestamp => tokens.push(frame.timestamp_ms.to_string()),
                StreamField::Filename => tokens.push(frame.image_id.clone()),
                _ => {}
            }
        }
        for pupil in &frame.pupils {
            for field in &self.fields {
                if field.is_per_pupil() {
                    field.push_pupil_tokens(pupil, &mut tokens);
                }
            }
        }
        let mut line = tokens.join(";");
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pupil_types::ProcMode;

    fn pupil(cx: f64, d: f64) -> Pupil {
        Pupil {
            center_x: cx,
            center_y: 50.0,
            width: d,
            height: d - 2.0,
            angle: 0.0,
            confidence: 0.8,
            outline_confidence: 0.75,
            physical_diameter_mm: Some(3.5),
            undistorted_diameter_px: None,
        }
    }

    #[test]
    fn full_template_matches_wire_order() {
        let frame = PupilFrame {
            timestamp_ms: 42,
            mode: ProcMode::SingleImageOnePupil,
            pupils: vec![pupil(10.0, 20.0)],
            trial: 1,
            image_id: "a.png".to_string(),
        };
        let line = FieldTemplate::full().format_line(&frame);
        assert_eq!(line, "1;42;a.png;10;50;20;18;0.8;0.75;20;;3.5\n");
    }

    #[test]
    fn per_pupil_fields_repeat_per_slot() {
        let frame = PupilFrame {
            timestamp_ms: 7,
            mode: ProcMode::SingleImageTwoPupil,
            pupils: vec![pupil(10.0, 20.0), pupil(90.0, 16.0)],
            trial: 0,
            image_id: "b.png".to_string(),
        };
        let template = FieldTemplate::parse("trial;diameter;confidence").unwrap();
        assert_eq!(template.format_line(&frame), "0;20;0.8;16;0.8\n");
    }

    #[test]
    fn unknown_and_empty_templates_are_rejected() {
        assert!(matches!(
            FieldTemplate::parse("trial;gaze"),
            Err(Error::UnknownField(_))
        ));
        assert!(matches!(FieldTemplate::parse(""), Err(Error::EmptyTemplate)));
    }
}
