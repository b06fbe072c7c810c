use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDateTime;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::TaskError;
use crate::model::Detection;

/// Timestamp format of the catalog's `Time` parameter.
const RUN_DATE_FORMAT: &str = "%a, %d %b %Y, %H:%M:%S";

/// Parsed source-finder output catalog (VOTable).
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Creation timestamp of the catalog. Required; its absence is fatal.
    pub run_date: NaiveDateTime,
    /// Producing-tool version string, when present.
    pub version: Option<String>,
    pub sources: Vec<SourceRecord>,
}

/// One candidate row: the catalog-local numeric id (used for cubelet file
/// naming) plus the typed measurement record.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: i64,
    pub detection: Detection,
}

pub async fn read_catalog(path: &Path) -> Result<Catalog, TaskError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse(path, &content)
}

pub(crate) fn parse(path: &Path, content: &str) -> Result<Catalog, TaskError> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut params: HashMap<String, String> = HashMap::new();
    let mut fields: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_td = false;
    let mut td = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"PARAM" => collect_param(path, &e, &mut params)?,
                b"FIELD" => collect_field(path, &e, &mut fields)?,
                b"TR" => row.clear(),
                b"TD" => {
                    in_td = true;
                    td.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"PARAM" => collect_param(path, &e, &mut params)?,
                b"FIELD" => collect_field(path, &e, &mut fields)?,
                b"TD" => row.push(String::new()),
                _ => {}
            },
            Ok(Event::Text(t)) if in_td => {
                let text = t
                    .unescape()
                    .map_err(|e| TaskError::catalog(path, format!("malformed XML: {e}")))?;
                td.push_str(&text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"TD" => {
                    in_td = false;
                    row.push(std::mem::take(&mut td));
                }
                b"TR" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(TaskError::catalog(path, format!("malformed XML: {e}"))),
        }
    }

    let run_date = params
        .get("Time")
        .ok_or_else(|| TaskError::catalog(path, "run date not found in catalog"))?;
    let run_date = NaiveDateTime::parse_from_str(run_date, RUN_DATE_FORMAT)
        .map_err(|e| TaskError::catalog(path, format!("invalid run date {run_date:?}: {e}")))?;
    let version = params.get("Creator").cloned();

    let sources = rows
        .iter()
        .enumerate()
        .map(|(index, values)| to_record(path, index, &fields, values))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Catalog {
        run_date,
        version,
        sources,
    })
}

fn collect_param(
    path: &Path,
    element: &BytesStart<'_>,
    params: &mut HashMap<String, String>,
) -> Result<(), TaskError> {
    let mut name = None;
    let mut value = None;
    for attr in element.attributes() {
        let attr = attr.map_err(|e| TaskError::catalog(path, format!("malformed XML: {e}")))?;
        let attr_value = attr
            .unescape_value()
            .map_err(|e| TaskError::catalog(path, format!("malformed XML: {e}")))?;
        match attr.key.as_ref() {
            b"name" => name = Some(attr_value.into_owned()),
            b"value" => value = Some(attr_value.into_owned()),
            _ => {}
        }
    }
    if let (Some(name), Some(value)) = (name, value) {
        params.insert(name, value);
    }
    Ok(())
}

fn collect_field(
    path: &Path,
    element: &BytesStart<'_>,
    fields: &mut Vec<String>,
) -> Result<(), TaskError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| TaskError::catalog(path, format!("malformed XML: {e}")))?;
        if attr.key.as_ref() == b"name" {
            let value = attr
                .unescape_value()
                .map_err(|e| TaskError::catalog(path, format!("malformed XML: {e}")))?;
            fields.push(value.into_owned());
        }
    }
    Ok(())
}

struct Row<'a> {
    path: &'a Path,
    index: usize,
    values: HashMap<&'a str, &'a str>,
}

impl Row<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).copied().filter(|v| !v.is_empty())
    }

    fn req_str(&self, key: &str) -> Result<String, TaskError> {
        self.raw(key).map(str::to_string).ok_or_else(|| {
            TaskError::catalog(
                self.path,
                format!("row {}: required field {key} is missing", self.index),
            )
        })
    }

    fn req_f64(&self, key: &str) -> Result<f64, TaskError> {
        self.opt_f64(key)?.ok_or_else(|| {
            TaskError::catalog(
                self.path,
                format!("row {}: required field {key} is missing or nan", self.index),
            )
        })
    }

    fn opt_f64(&self, key: &str) -> Result<Option<f64>, TaskError> {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        if value.contains("nan") {
            return Ok(None);
        }
        value.parse::<f64>().map(Some).map_err(|_| {
            TaskError::catalog(
                self.path,
                format!("row {}: field {key} is not numeric: {value:?}", self.index),
            )
        })
    }
}

fn to_record(
    path: &Path,
    index: usize,
    fields: &[String],
    values: &[String],
) -> Result<SourceRecord, TaskError> {
    if fields.len() != values.len() {
        return Err(TaskError::catalog(
            path,
            format!(
                "row {index} has {} values for {} fields",
                values.len(),
                fields.len()
            ),
        ));
    }

    let row = Row {
        path,
        index,
        values: fields
            .iter()
            .map(String::as_str)
            .zip(values.iter().map(String::as_str))
            .collect(),
    };

    let detection = Detection {
        name: row.req_str("name")?,
        x: row.req_f64("x")?,
        y: row.req_f64("y")?,
        z: row.req_f64("z")?,
        x_min: row.opt_f64("x_min")?,
        x_max: row.opt_f64("x_max")?,
        y_min: row.opt_f64("y_min")?,
        y_max: row.opt_f64("y_max")?,
        z_min: row.opt_f64("z_min")?,
        z_max: row.opt_f64("z_max")?,
        n_pix: row.opt_f64("n_pix")?,
        f_min: row.opt_f64("f_min")?,
        f_max: row.opt_f64("f_max")?,
        f_sum: row.req_f64("f_sum")?,
        rel: row.opt_f64("rel")?,
        flag: row.req_f64("flag")? as i32,
        rms: row.opt_f64("rms")?,
        w20: row.req_f64("w20")?,
        w50: row.req_f64("w50")?,
        ell_maj: row.req_f64("ell_maj")?,
        ell_min: row.req_f64("ell_min")?,
        ell_pa: row.opt_f64("ell_pa")?,
        ell3s_maj: row.opt_f64("ell3s_maj")?,
        ell3s_min: row.opt_f64("ell3s_min")?,
        ell3s_pa: row.opt_f64("ell3s_pa")?,
        kin_pa: row.opt_f64("kin_pa")?,
        err_x: row.req_f64("err_x")?,
        err_y: row.req_f64("err_y")?,
        err_z: row.req_f64("err_z")?,
        err_f_sum: row.opt_f64("err_f_sum")?,
        ra: row.opt_f64("ra")?,
        dec: row.opt_f64("dec")?,
        freq: row.opt_f64("freq")?,
        l: row.opt_f64("l")?,
        b: row.opt_f64("b")?,
        v_rad: row.opt_f64("v_rad")?,
        v_opt: row.opt_f64("v_opt")?,
        v_app: row.opt_f64("v_app")?,
        wm50: row.opt_f64("wm50")?,
        x_peak: row.opt_f64("x_peak")?,
        y_peak: row.opt_f64("y_peak")?,
        z_peak: row.opt_f64("z_peak")?,
        ra_peak: row.opt_f64("ra_peak")?,
        dec_peak: row.opt_f64("dec_peak")?,
        freq_peak: row.opt_f64("freq_peak")?,
        l_peak: row.opt_f64("l_peak")?,
        b_peak: row.opt_f64("b_peak")?,
        v_rad_peak: row.opt_f64("v_rad_peak")?,
        v_opt_peak: row.opt_f64("v_opt_peak")?,
        v_app_peak: row.opt_f64("v_app_peak")?,
    };

    let id = row.req_f64("id")? as i64;

    Ok(SourceRecord { id, detection })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votable(params: &str, fields: &[&str], rows: &[&[&str]]) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?>\n<VOTABLE>\n<RESOURCE>\n");
        out.push_str(params);
        out.push_str("<TABLE>\n");
        for field in fields {
            out.push_str(&format!("<FIELD name=\"{field}\" datatype=\"double\"/>\n"));
        }
        out.push_str("<DATA><TABLEDATA>\n");
        for row in rows {
            out.push_str("<TR>");
            for value in *row {
                out.push_str(&format!("<TD>{value}</TD>"));
            }
            out.push_str("</TR>\n");
        }
        out.push_str("</TABLEDATA></DATA></TABLE></RESOURCE></VOTABLE>\n");
        out
    }

    const FIELDS: &[&str] = &[
        "id", "name", "x", "y", "z", "f_sum", "flag", "w20", "w50", "ell_maj", "ell_min", "err_x",
        "err_y", "err_z", "rel",
    ];

    fn path() -> &'static Path {
        Path::new("survey_cat.xml")
    }

    #[test]
    fn parses_sources_and_metadata() {
        let content = votable(
            "<PARAM name=\"Time\" value=\"Wed, 01 Dec 2021, 10:02:30\"/>\n\
             <PARAM name=\"Creator\" value=\"SoFiA 2.3.1\"/>\n",
            FIELDS,
            &[&[
                "1", "SoFiA J1234", "10.5", "11.5", "3.0", "100.0", "0", "20.0", "10.0", "5.0",
                "2.0", "0.1", "0.1", "0.2", "0.9",
            ]],
        );
        let catalog = parse(path(), &content).unwrap();
        assert_eq!(catalog.version.as_deref(), Some("SoFiA 2.3.1"));
        assert_eq!(
            catalog.run_date,
            NaiveDateTime::parse_from_str("2021-12-01 10:02:30", "%Y-%m-%d %H:%M:%S").unwrap()
        );
        assert_eq!(catalog.sources.len(), 1);
        let source = &catalog.sources[0];
        assert_eq!(source.id, 1);
        assert_eq!(source.detection.name, "SoFiA J1234");
        assert_eq!(source.detection.x, 10.5);
        assert_eq!(source.detection.flag, 0);
        assert_eq!(source.detection.rel, Some(0.9));
    }

    #[test]
    fn nan_tokens_map_to_none_for_optional_fields() {
        let content = votable(
            "<PARAM name=\"Time\" value=\"Wed, 01 Dec 2021, 10:02:30\"/>\n",
            FIELDS,
            &[&[
                "1", "J0001", "1", "2", "3", "4", "0", "5", "6", "7", "8", "0.1", "0.1", "0.1",
                "nan",
            ]],
        );
        let catalog = parse(path(), &content).unwrap();
        assert_eq!(catalog.sources[0].detection.rel, None);
    }

    #[test]
    fn nan_in_a_required_field_is_an_error() {
        let content = votable(
            "<PARAM name=\"Time\" value=\"Wed, 01 Dec 2021, 10:02:30\"/>\n",
            FIELDS,
            &[&[
                "1", "J0001", "nan", "2", "3", "4", "0", "5", "6", "7", "8", "0.1", "0.1", "0.1",
                "0.9",
            ]],
        );
        assert!(matches!(
            parse(path(), &content),
            Err(TaskError::Catalog { .. })
        ));
    }

    #[test]
    fn missing_run_date_is_fatal() {
        let content = votable("<PARAM name=\"Creator\" value=\"SoFiA\"/>\n", FIELDS, &[]);
        let err = parse(path(), &content).unwrap_err();
        assert!(err.to_string().contains("run date"));
    }

    #[test]
    fn empty_catalog_has_no_sources() {
        let content = votable(
            "<PARAM name=\"Time\" value=\"Wed, 01 Dec 2021, 10:02:30\"/>\n",
            FIELDS,
            &[],
        );
        assert!(parse(path(), &content).unwrap().sources.is_empty());
    }
}
