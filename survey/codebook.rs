//! The variable book: which survey variables the analysis keeps, how they are
//! grouped, and which numeric codes each of them uses for "not applicable",
//! "invalid", "no response" and similar non-answers.

use serde::{Deserialize, Serialize};

/// A named group of survey variables. Groups may be split into sub-blocks,
/// as the teacher/classroom/home block is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableGroup {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub subgroups: Vec<VariableGroup>,
}

impl VariableGroup {
    fn flat(name: &str, variables: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            subgroups: Vec::new(),
        }
    }

    fn nested(name: &str, subgroups: Vec<VariableGroup>) -> Self {
        Self {
            name: name.to_string(),
            variables: Vec::new(),
            subgroups,
        }
    }

    fn collect_into(&self, out: &mut Vec<String>) {
        out.extend(self.variables.iter().cloned());
        for group in &self.subgroups {
            group.collect_into(out);
        }
    }
}

/// Sentinel codes for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidCodes {
    pub variable: String,
    pub codes: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    pub groups: Vec<VariableGroup>,
    pub invalid_codes: Vec<InvalidCodes>,
}

const SCALE_CODES: [f64; 4] = [95.0, 97.0, 98.0, 99.0];
const SINGLE_DIGIT_CODES: [f64; 4] = [5.0, 7.0, 8.0, 9.0];

const BACKGROUND: [&str; 9] = [
    "ST004D01T", "AGE", "ISCEDP", "IMMIG", "LANGN", "CNT", "CNTSCHID", "W_FSTUWT", "CNTSTUID",
];
const PSYCHOLOGICAL: [&str; 24] = [
    "EXPECEDU", "OCOD3", "BSMJ", "SISCO", "GROSAGR", "ANXMAT", "MATHEFF", "MATHEF21", "MATHPERS",
    "ASSERAGR", "COOPAGR", "CURIOAGR", "EMOCOAGR", "EMPATAGR", "PERSEVAGR", "STRESAGR",
    "CREATEFF", "CREATOP", "IMAGINE", "OPENART", "SDLEFF", "ST268Q04JA", "ST268Q07JA",
    "ST268Q01JA",
];
const PRACTICE: [&str; 13] = [
    "REPEAT", "MISSSC", "SKIPPING", "TARDYSD", "EXERPRAC", "STUDYHMW", "WORKPAY", "WORKHOME",
    "INFOSEEK", "EXPOFA", "EXPO21ST", "CREATAS", "CREATOOS",
];
const TEACHER_CLASSROOM: [&str; 6] =
    ["TEACHSUP", "RELATST", "COGACRCO", "COGACMCO", "DISCLIM", "CREATSCH"];
const HOME_LEARNING: [&str; 3] = ["FAMSUP", "CREATFAM", "FAMSUPSL"];
const REMOTE_LEARNING: [&str; 3] = ["FEELLAH", "PROBSELF", "LEARRES"];
const SCHOOL_EXPERIENCE: [&str; 5] = ["BULLIED", "FEELSAFE", "SCHRISK", "BELONG", "SCHSUST"];

impl Default for Codebook {
    fn default() -> Self {
        let groups = vec![
            VariableGroup::flat("Background_Control_Variables", &BACKGROUND),
            VariableGroup::flat("Student_Psychological_Variables", &PSYCHOLOGICAL),
            VariableGroup::flat("Student_Practice_Variables", &PRACTICE),
            VariableGroup::nested(
                "Teacher_Classroom_Home_Experience",
                vec![
                    VariableGroup::flat("Teacher_Classroom_Experience", &TEACHER_CLASSROOM),
                    VariableGroup::flat(
                        "Home_Learning_Environment_Family_Support",
                        &HOME_LEARNING,
                    ),
                    VariableGroup::flat(
                        "Remote_Learning_Global_Crisis_Experience",
                        &REMOTE_LEARNING,
                    ),
                ],
            ),
            VariableGroup::flat("School_Experience_Variables", &SCHOOL_EXPERIENCE),
        ];

        let single_digit = ["ST004D01T", "IMMIG", "SISCO", "REPEAT", "MISSSC", "SKIPPING", "TARDYSD"];
        let mut invalid_codes = vec![
            InvalidCodes {
                variable: "AGE".to_string(),
                codes: vec![9995.0, 9997.0, 9998.0, 9999.0],
            },
            InvalidCodes {
                variable: "ISCEDP".to_string(),
                codes: vec![999.0],
            },
            InvalidCodes {
                variable: "LANGN".to_string(),
                codes: vec![997.0, 998.0, 999.0],
            },
            InvalidCodes {
                variable: "OCOD3".to_string(),
                codes: vec![9999.0],
            },
        ];
        for variable in single_digit {
            invalid_codes.push(InvalidCodes {
                variable: variable.to_string(),
                codes: SINGLE_DIGIT_CODES.to_vec(),
            });
        }
        let scale_variables = PSYCHOLOGICAL
            .iter()
            .chain(PRACTICE.iter())
            .chain(TEACHER_CLASSROOM.iter())
            .chain(HOME_LEARNING.iter())
            .chain(REMOTE_LEARNING.iter())
            .chain(SCHOOL_EXPERIENCE.iter())
            .copied()
            .filter(|name| !single_digit.contains(name) && *name != "OCOD3");
        for variable in scale_variables {
            invalid_codes.push(InvalidCodes {
                variable: variable.to_string(),
                codes: SCALE_CODES.to_vec(),
            });
        }

        Self {
            groups,
            invalid_codes,
        }
    }
}

impl Codebook {
    /// All variables in declaration order, sub-blocks flattened.
    pub fn all_variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        for group in &self.groups {
            group.collect_into(&mut out);
        }
        out
    }

    pub fn codes_for(&self, variable: &str) -> Option<&[f64]> {
        self.invalid_codes
            .iter()
            .find(|entry| entry.variable == variable)
            .map(|entry| entry.codes.as_slice())
    }
}

/// Replaces every value equal to one of `codes` with `NaN`. Returns the number
/// of cells changed.
pub fn replace_codes(values: &mut [f64], codes: &[f64]) -> usize {
    let mut replaced = 0;
    for value in values.iter_mut() {
        if codes.iter().any(|code| *value == *code) {
            *value = f64::NAN;
            replaced += 1;
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codebook_flattens_nested_groups() {
        let book = Codebook::default();
        let all = book.all_variables();
        assert_eq!(all.len(), 9 + 24 + 13 + 6 + 3 + 3 + 5);
        assert!(all.contains(&"FAMSUPSL".to_string()));
        assert_eq!(all[0], "ST004D01T");
    }

    #[test]
    fn codes_follow_variable_kind() {
        let book = Codebook::default();
        assert_eq!(book.codes_for("REPEAT").unwrap(), &SINGLE_DIGIT_CODES);
        assert_eq!(book.codes_for("ANXMAT").unwrap(), &SCALE_CODES);
        assert_eq!(book.codes_for("OCOD3").unwrap(), &[9999.0]);
        assert!(book.codes_for("CNT").is_none());
    }

    #[test]
    fn replacement_only_touches_listed_codes() {
        let mut values = vec![1.0, 95.0, 94.0, 99.0, f64::NAN, 97.5];
        let replaced = replace_codes(&mut values, &SCALE_CODES);
        assert_eq!(replaced, 2);
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 94.0);
        assert!(values[3].is_nan());
        assert_eq!(values[5], 97.5);
    }
}
