//! Parsers and structural diffs for tracked files. Three formats: INI
//! (two-level section/key diff), JSON (one-level diff over the top-level
//! object), and GENERIC (Myers shortest edit script over lines). Each diff
//! can be reverse-applied to reconstruct the previous revision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type IniData = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    #[serde(rename = "INI")]
    Ini,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "GENERIC")]
    Generic,
}

impl FileFormat {
    /// Accepts the full name or its three-letter abbreviation.
    pub fn parse_name(name: &str) -> Option<FileFormat> {
        match name {
            "INI" => Some(FileFormat::Ini),
            "JSON" | "JSO" => Some(FileFormat::Json),
            "GENERIC" | "GEN" => Some(FileFormat::Generic),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FileFormat::Ini => "INI",
            FileFormat::Json => "JSON",
            FileFormat::Generic => "GENERIC",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("ini parse error at line {line}: {reason}")]
    Ini { line: usize, reason: &'static str },
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("top-level json value is not an object")]
    NotAnObject,
    #[error("backup blob does not match its recorded format")]
    BadBackup,
}

/// A parsed file, the unit stored as a backup and compared for diffs.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Ini(IniData),
    Json(Map<String, Value>),
    Generic(Vec<String>),
}

impl Parsed {
    pub fn parse(format: FileFormat, text: &str) -> Result<Parsed, ParseError> {
        match format {
            FileFormat::Ini => parse_ini(text).map(Parsed::Ini),
            FileFormat::Json => match serde_json::from_str(text)? {
                Value::Object(map) => Ok(Parsed::Json(map)),
                _ => Err(ParseError::NotAnObject),
            },
            FileFormat::Generic => {
                Ok(Parsed::Generic(text.lines().map(str::to_string).collect()))
            }
        }
    }

    pub fn format(&self) -> FileFormat {
        match self {
            Parsed::Ini(_) => FileFormat::Ini,
            Parsed::Json(_) => FileFormat::Json,
            Parsed::Generic(_) => FileFormat::Generic,
        }
    }

    /// The backup blob written to the store.
    pub fn to_value(&self) -> Value {
        match self {
            Parsed::Ini(sections) => serde_json::to_value(sections).unwrap_or(Value::Null),
            Parsed::Json(map) => Value::Object(map.clone()),
            Parsed::Generic(lines) => {
                let mut map = Map::new();
                map.insert(
                    "lines".to_string(),
                    Value::Array(lines.iter().cloned().map(Value::String).collect()),
                );
                Value::Object(map)
            }
        }
    }

    pub fn from_value(format: FileFormat, value: Value) -> Result<Parsed, ParseError> {
        match format {
            FileFormat::Ini => serde_json::from_value(value)
                .map(Parsed::Ini)
                .map_err(|_| ParseError::BadBackup),
            FileFormat::Json => match value {
                Value::Object(map) => Ok(Parsed::Json(map)),
                _ => Err(ParseError::BadBackup),
            },
            FileFormat::Generic => {
                let lines = value
                    .get("lines")
                    .and_then(Value::as_array)
                    .ok_or(ParseError::BadBackup)?
                    .iter()
                    .map(|line| line.as_str().map(str::to_string))
                    .collect::<Option<Vec<String>>>()
                    .ok_or(ParseError::BadBackup)?;
                Ok(Parsed::Generic(lines))
            }
        }
    }
}

fn parse_ini(text: &str) -> Result<IniData, ParseError> {
    let mut sections = IniData::new();
    let mut current: Option<String> = None;
    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
        } else if let Some(pos) = line.find(['=', ':']) {
            let section = current.as_ref().ok_or(ParseError::Ini {
                line: index + 1,
                reason: "key outside any section",
            })?;
            let key = line[..pos].trim().to_string();
            let value = line[pos + 1..].trim().to_string();
            sections
                .get_mut(section)
                .expect("current section exists")
                .insert(key, value);
        } else {
            return Err(ParseError::Ini {
                line: index + 1,
                reason: "expected section header or key-value pair",
            });
        }
    }
    Ok(sections)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SectionDiff {
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub del: BTreeMap<String, String>,
    #[serde(default, rename = "mod")]
    pub modified: BTreeMap<String, (String, String)>,
}

impl SectionDiff {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IniDiff {
    #[serde(default)]
    pub add: IniData,
    #[serde(default)]
    pub del: IniData,
    #[serde(default, rename = "mod")]
    pub modified: BTreeMap<String, SectionDiff>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JsonDiff {
    #[serde(default)]
    pub add: Map<String, Value>,
    #[serde(default)]
    pub del: Map<String, Value>,
    #[serde(default, rename = "mod")]
    pub modified: BTreeMap<String, (Value, Value)>,
}

/// An edit in a generic diff: `("+"| "-", line index, content)`. Added
/// lines index into the new revision, deleted lines into the old one.
pub type Edit = (String, usize, String);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenericDiff {
    #[serde(rename = "add/del")]
    pub edits: Vec<Edit>,
}

/// A structural delta between two revisions of the same format.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    Ini(IniDiff),
    Json(JsonDiff),
    Generic(GenericDiff),
}

impl Diff {
    pub fn to_value(&self) -> Value {
        let result = match self {
            Diff::Ini(diff) => serde_json::to_value(diff),
            Diff::Json(diff) => serde_json::to_value(diff),
            Diff::Generic(diff) => serde_json::to_value(diff),
        };
        result.unwrap_or(Value::Null)
    }

    /// Diff blobs carry no format tag of their own; the index entry's
    /// format decides how to decode them.
    pub fn from_value(format: FileFormat, value: Value) -> Result<Diff, ParseError> {
        match format {
            FileFormat::Ini => serde_json::from_value(value)
                .map(Diff::Ini)
                .map_err(|_| ParseError::BadBackup),
            FileFormat::Json => serde_json::from_value(value)
                .map(Diff::Json)
                .map_err(|_| ParseError::BadBackup),
            FileFormat::Generic => serde_json::from_value(value)
                .map(Diff::Generic)
                .map_err(|_| ParseError::BadBackup),
        }
    }
}

/// Structural diff taking `old` to `new`; `None` when nothing changed (or
/// the formats disagree, which callers rule out).
pub fn diff(old: &Parsed, new: &Parsed) -> Option<Diff> {
    match (old, new) {
        (Parsed::Ini(old), Parsed::Ini(new)) => ini_diff(old, new).map(Diff::Ini),
        (Parsed::Json(old), Parsed::Json(new)) => json_diff(old, new).map(Diff::Json),
        (Parsed::Generic(old), Parsed::Generic(new)) => {
            let edits = myers_edits(old, new);
            (!edits.is_empty()).then(|| Diff::Generic(GenericDiff { edits }))
        }
        _ => None,
    }
}

/// Reverse-applies `diff` to `current`, reconstructing the prior revision.
pub fn reset(current: &Parsed, diff: &Diff) -> Parsed {
    match (current, diff) {
        (Parsed::Ini(data), Diff::Ini(diff)) => Parsed::Ini(ini_reset(data, diff)),
        (Parsed::Json(data), Diff::Json(diff)) => Parsed::Json(json_reset(data, diff)),
        (Parsed::Generic(lines), Diff::Generic(diff)) => {
            Parsed::Generic(generic_reset(lines, &diff.edits))
        }
        _ => current.clone(),
    }
}

fn ini_diff(old: &IniData, new: &IniData) -> Option<IniDiff> {
    let mut diff = IniDiff::default();
    for (section, keys) in new {
        if !old.contains_key(section) {
            diff.add.insert(section.clone(), keys.clone());
        }
    }
    for (section, keys) in old {
        if !new.contains_key(section) {
            diff.del.insert(section.clone(), keys.clone());
        }
    }
    for (section, old_keys) in old {
        let Some(new_keys) = new.get(section) else {
            continue;
        };
        let mut section_diff = SectionDiff::default();
        for (key, value) in new_keys {
            if !old_keys.contains_key(key) {
                section_diff.add.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in old_keys {
            match new_keys.get(key) {
                None => {
                    section_diff.del.insert(key.clone(), value.clone());
                }
                Some(new_value) if new_value != value => {
                    section_diff
                        .modified
                        .insert(key.clone(), (value.clone(), new_value.clone()));
                }
                Some(_) => {}
            }
        }
        if !section_diff.is_empty() {
            diff.modified.insert(section.clone(), section_diff);
        }
    }
    let changed = !diff.add.is_empty() || !diff.del.is_empty() || !diff.modified.is_empty();
    changed.then_some(diff)
}

fn ini_reset(current: &IniData, diff: &IniDiff) -> IniData {
    let mut previous = IniData::new();
    let sections: Vec<&String> = current.keys().chain(diff.del.keys()).collect();
    for section in sections {
        if diff.add.contains_key(section) {
            continue;
        }
        if let Some(deleted) = diff.del.get(section) {
            previous.insert(section.clone(), deleted.clone());
            continue;
        }
        let Some(keys) = current.get(section) else {
            continue;
        };
        if let Some(section_diff) = diff.modified.get(section) {
            let mut restored = BTreeMap::new();
            let names: Vec<&String> = keys.keys().chain(section_diff.del.keys()).collect();
            for key in names {
                if section_diff.add.contains_key(key) {
                    continue;
                }
                if let Some(value) = section_diff.del.get(key) {
                    restored.insert(key.clone(), value.clone());
                } else if let Some((old_value, _)) = section_diff.modified.get(key) {
                    restored.insert(key.clone(), old_value.clone());
                } else if let Some(value) = keys.get(key) {
                    restored.insert(key.clone(), value.clone());
                }
            }
            previous.insert(section.clone(), restored);
        } else {
            previous.insert(section.clone(), keys.clone());
        }
    }
    previous
}

fn json_diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Option<JsonDiff> {
    let mut diff = JsonDiff::default();
    for (key, value) in new {
        if !old.contains_key(key) {
            diff.add.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in old {
        match new.get(key) {
            None => {
                diff.del.insert(key.clone(), value.clone());
            }
            Some(new_value) if new_value != value => {
                diff.modified
                    .insert(key.clone(), (value.clone(), new_value.clone()));
            }
            Some(_) => {}
        }
    }
    let changed = !diff.add.is_empty() || !diff.del.is_empty() || !diff.modified.is_empty();
    changed.then_some(diff)
}

fn json_reset(current: &Map<String, Value>, diff: &JsonDiff) -> Map<String, Value> {
    let mut previous = Map::new();
    for (key, value) in current {
        if diff.add.contains_key(key) {
            continue;
        }
        if let Some((old_value, _)) = diff.modified.get(key) {
            previous.insert(key.clone(), old_value.clone());
        } else {
            previous.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &diff.del {
        previous.insert(key.clone(), value.clone());
    }
    previous
}

/// Myers shortest-edit-script over line arrays. Matched lines are walked
/// but only additions and deletions are recorded.
fn myers_edits(a: &[String], b: &[String]) -> Vec<Edit> {
    let n = a.len() as i64;
    let m = b.len() as i64;
    let mut front: BTreeMap<i64, (i64, Vec<(char, i64)>)> = BTreeMap::new();
    front.insert(1, (0, Vec::new()));

    for d in 0..=(n + m) {
        for k in (-d..=d).step_by(2) {
            let go_down = k == -d || (k != d && front[&(k - 1)].0 < front[&(k + 1)].0);
            let (old_x, mut history) = if go_down {
                front[&(k + 1)].clone()
            } else {
                front[&(k - 1)].clone()
            };
            let mut x = if go_down { old_x } else { old_x + 1 };
            let mut y = x - k;

            if (1..=m).contains(&y) && go_down {
                history.push(('+', y - 1));
            } else if (1..=n).contains(&x) {
                history.push(('-', x - 1));
            }

            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
                history.push(('*', x - 1));
            }

            if x >= n && y >= m {
                return history
                    .into_iter()
                    .filter_map(|(op, line)| match op {
                        '+' => Some(("+".to_string(), line as usize, b[line as usize].clone())),
                        '-' => Some(("-".to_string(), line as usize, a[line as usize].clone())),
                        _ => None,
                    })
                    .collect();
            }

            front.insert(k, (x, history));
        }
    }
    Vec::new()
}

fn generic_reset(current: &[String], edits: &[Edit]) -> Vec<String> {
    let mut previous = Vec::new();
    let mut cursor = 0usize;
    for (op, line, text) in edits {
        if op == "+" {
            while cursor < *line && cursor < current.len() {
                previous.push(current[cursor].clone());
                cursor += 1;
            }
            cursor = line + 1;
        } else if op == "-" {
            while previous.len() < *line && cursor < current.len() {
                previous.push(current[cursor].clone());
                cursor += 1;
            }
            previous.push(text.clone());
        }
    }
    while cursor < current.len() {
        previous.push(current[cursor].clone());
        cursor += 1;
    }
    previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ini(text: &str) -> Parsed {
        Parsed::parse(FileFormat::Ini, text).unwrap()
    }

    fn lines(text: &str) -> Parsed {
        Parsed::parse(FileFormat::Generic, text).unwrap()
    }

    #[test]
    fn ini_parse_sections_and_comments() {
        let parsed = ini("# header\n[a]\nk = 1\nj: 2\n\n[empty]\n");
        let Parsed::Ini(sections) = &parsed else {
            panic!("wrong variant");
        };
        assert_eq!(sections["a"]["k"], "1");
        assert_eq!(sections["a"]["j"], "2");
        assert!(sections["empty"].is_empty());
    }

    #[test]
    fn ini_parse_rejects_stray_keys() {
        assert!(matches!(
            Parsed::parse(FileFormat::Ini, "k = 1"),
            Err(ParseError::Ini { line: 1, .. })
        ));
        assert!(matches!(
            Parsed::parse(FileFormat::Ini, "[a]\nnot a pair"),
            Err(ParseError::Ini { line: 2, .. })
        ));
    }

    #[test]
    fn ini_diff_shape_matches_the_contract() {
        let old = ini("[a]\nk = 1\n");
        let new = ini("[a]\nk = 2\n[b]\nj = 3\n");
        let diff = diff(&old, &new).unwrap();
        assert_eq!(
            diff.to_value(),
            json!({
                "add": {"b": {"j": "3"}},
                "del": {},
                "mod": {"a": {"add": {}, "del": {}, "mod": {"k": ["1", "2"]}}}
            })
        );
    }

    #[test]
    fn ini_reset_recovers_the_old_revision() {
        let old = ini("[a]\nk = 1\ngone = x\n[dropped]\nv = 9\n");
        let new = ini("[a]\nk = 2\nfresh = y\n[b]\nj = 3\n");
        let d = diff(&old, &new).unwrap();
        assert_eq!(reset(&new, &d), old);
    }

    #[test]
    fn identical_inis_produce_no_diff() {
        let a = ini("[a]\nk = 1\n");
        let b = ini("[a]\nk=1\n");
        assert!(diff(&a, &b).is_none());
    }

    #[test]
    fn json_diff_and_reset() {
        let old = Parsed::parse(FileFormat::Json, r#"{"a": 1, "b": {"x": [1, 2]}, "c": 3}"#)
            .unwrap();
        let new = Parsed::parse(FileFormat::Json, r#"{"a": 2, "b": {"x": [1, 2]}, "d": 4}"#)
            .unwrap();
        let d = diff(&old, &new).unwrap();
        assert_eq!(
            d.to_value(),
            json!({
                "add": {"d": 4},
                "del": {"c": 3},
                "mod": {"a": [1, 2]}
            })
        );
        assert_eq!(reset(&new, &d), old);
        // Deep equality: the untouched nested value does not register.
        assert!(diff(&new, &new).is_none());
    }

    #[test]
    fn json_parse_requires_an_object() {
        assert!(matches!(
            Parsed::parse(FileFormat::Json, "[1, 2]"),
            Err(ParseError::NotAnObject)
        ));
    }

    #[test]
    fn generic_diff_records_adds_and_dels() {
        let old = lines("a\nb\nc\n");
        let new = lines("a\nx\nc\n");
        let Diff::Generic(generic) = diff(&old, &new).unwrap() else {
            panic!("wrong variant");
        };
        assert!(generic.edits.iter().any(|(op, _, text)| op == "-" && text == "b"));
        assert!(generic.edits.iter().any(|(op, _, text)| op == "+" && text == "x"));
    }

    #[test]
    fn generic_reset_recovers_the_old_lines() {
        let cases = [
            ("a\nb\nc\n", "a\nx\nc\n"),
            ("a\nb\n", "a\nb\nc\nd\n"),
            ("a\nb\nc\nd\n", "b\nd\n"),
            ("", "fresh\nfile\n"),
            ("whole\nfile\n", ""),
        ];
        for (old_text, new_text) in cases {
            let old = lines(old_text);
            let new = lines(new_text);
            match diff(&old, &new) {
                Some(d) => assert_eq!(reset(&new, &d), old, "case {old_text:?} -> {new_text:?}"),
                None => assert_eq!(old, new),
            }
        }
    }

    #[test]
    fn backup_blobs_round_trip() {
        for parsed in [
            ini("[a]\nk = 1\n"),
            Parsed::parse(FileFormat::Json, r#"{"a": 1}"#).unwrap(),
            lines("one\ntwo\n"),
        ] {
            let format = parsed.format();
            let value = parsed.to_value();
            assert_eq!(Parsed::from_value(format, value).unwrap(), parsed);
        }
    }

    #[test]
    fn diff_blobs_round_trip() {
        let old = lines("a\nb\n");
        let new = lines("a\nc\n");
        let d = diff(&old, &new).unwrap();
        let decoded = Diff::from_value(FileFormat::Generic, d.to_value()).unwrap();
        assert_eq!(decoded, d);
    }
}
