use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One generated clinical scenario.
///
/// `patient` and `triage` are what the player sees on admission. `hidden_truth`
/// is only ever sent back to the model; the presentation layer receives a
/// [`PatientCard`] instead of the full case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub patient: Patient,
    pub triage: Triage,
    pub hidden_truth: HiddenTruth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    #[serde(deserialize_with = "text")]
    pub name: String,
    #[serde(default, deserialize_with = "text")]
    pub age: String,
    #[serde(default, deserialize_with = "text")]
    pub gender: String,
    #[serde(default, deserialize_with = "text")]
    pub job: String,
    #[serde(default, deserialize_with = "text")]
    pub visual_appearance: String,
    #[serde(default, deserialize_with = "text")]
    pub personality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triage {
    #[serde(deserialize_with = "text")]
    pub chief_complaint: String,
    #[serde(default, deserialize_with = "text")]
    pub vitals: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenTruth {
    #[serde(default, deserialize_with = "text")]
    pub history_hpi: String,
    #[serde(default, deserialize_with = "text")]
    pub history_social: String,
    #[serde(default, deserialize_with = "text")]
    pub physical_exam: String,
    #[serde(default, deserialize_with = "text")]
    pub labs_and_imaging: String,
    #[serde(deserialize_with = "text")]
    pub diagnosis: String,
    #[serde(default, deserialize_with = "text")]
    pub pathophysiology: String,
}

/// The patient-facing portion of a case, safe to hand to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientCard {
    pub name: String,
    pub age: String,
    pub gender: String,
    pub job: String,
    pub visual_appearance: String,
    pub chief_complaint: String,
    pub vitals: String,
}

impl Case {
    pub fn card(&self) -> PatientCard {
        PatientCard {
            name: self.patient.name.clone(),
            age: self.patient.age.clone(),
            gender: self.patient.gender.clone(),
            job: self.patient.job.clone(),
            visual_appearance: self.patient.visual_appearance.clone(),
            chief_complaint: self.triage.chief_complaint.clone(),
            vitals: self.triage.vitals.clone(),
        }
    }

    /// The hidden truth as compact JSON, the form embedded in prompts.
    pub fn hidden_truth_json(&self) -> String {
        // Serializing a struct of strings cannot fail.
        serde_json::to_string(&self.hidden_truth).unwrap_or_default()
    }
}

/// Accepts any JSON leaf as text. Models regularly answer `"age": 54` or give
/// vitals as an object; non-string values are kept as their compact JSON.
fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_case() -> Case {
        Case {
            patient: Patient {
                name: "Maria das Dores".to_string(),
                age: "54".to_string(),
                gender: "Feminino".to_string(),
                job: "Costureira".to_string(),
                visual_appearance: "Ictérica, fácies de dor".to_string(),
                personality: "Prolixa".to_string(),
            },
            triage: Triage {
                chief_complaint: "Dor na barriga do lado direito".to_string(),
                vitals: "PA 130x80, FC 98, FR 18, Temp 38.2".to_string(),
            },
            hidden_truth: HiddenTruth {
                history_hpi: "Dor em HCD há 2 dias, pós-prandial".to_string(),
                history_social: "Nega etilismo".to_string(),
                physical_exam: "Murphy positivo".to_string(),
                labs_and_imaging: "Leuc 15k; USG com parede espessada".to_string(),
                diagnosis: "Colecistite aguda".to_string(),
                pathophysiology: "Obstrução do ducto cístico".to_string(),
            },
        }
    }

    #[test]
    fn test_case_deserializes_non_string_leaves() {
        let json = r#"{
            "patient": {"name": "João", "age": 67},
            "triage": {"chief_complaint": "Falta de ar", "vitals": {"PA": "150x90", "SatO2": 89}},
            "hidden_truth": {"diagnosis": "DPOC exacerbado", "labs_and_imaging": null}
        }"#;
        let case: Case = serde_json::from_str(json).unwrap();

        assert_eq!(case.patient.age, "67");
        assert_eq!(case.patient.job, "");
        assert_eq!(case.triage.vitals, r#"{"PA":"150x90","SatO2":89}"#);
        assert_eq!(case.hidden_truth.labs_and_imaging, "");
        assert_eq!(case.hidden_truth.diagnosis, "DPOC exacerbado");
    }

    #[test]
    fn test_case_requires_diagnosis() {
        let json = r#"{
            "patient": {"name": "João"},
            "triage": {"chief_complaint": "Tosse"},
            "hidden_truth": {}
        }"#;
        let result: Result<Case, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_card_hides_the_truth() {
        let case = sample_case();
        let card_json = serde_json::to_string(&case.card()).unwrap();

        assert!(card_json.contains("Maria das Dores"));
        assert!(card_json.contains("Dor na barriga"));
        assert!(!card_json.contains("Colecistite"));
        assert!(!card_json.contains("Murphy"));
    }

    #[test]
    fn test_hidden_truth_json() {
        let json = sample_case().hidden_truth_json();
        assert!(json.starts_with('{'));
        assert!(json.contains(r#""diagnosis":"Colecistite aguda""#));
    }
}
