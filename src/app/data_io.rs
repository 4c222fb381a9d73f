use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::api::{ApiError, DashboardApi};
use super::types::{ColumnSet, DataFormat, DateStyle, Opportunity, PLACEHOLDER};

pub const EXPORT_FILE_NAME: &str = "opportunities.xlsx";

const CSV_HEADERS: [&str; 12] = [
    "row",
    "id",
    "title",
    "description",
    "publish_date",
    "response_date",
    "link",
    "department",
    "notice_id",
    "naics",
    "location",
    "exported_at",
];

#[derive(Debug, Clone, Serialize)]
struct ExportRecord {
    row: usize,
    id: String,
    title: String,
    description: String,
    publish_date: String,
    response_date: String,
    link: String,
    department: String,
    notice_id: String,
    naics: String,
    location: String,
    exported_at: String,
}

fn opportunity_to_export_record(
    row: usize,
    opp: &Opportunity,
    date_style: DateStyle,
    exported_at: &str,
) -> ExportRecord {
    ExportRecord {
        row,
        id: opp.id.clone().unwrap_or_default(),
        title: opp.display_title().to_string(),
        description: opp.description.clone().unwrap_or_default(),
        publish_date: format_date(opp.publish_date.as_deref(), date_style),
        response_date: format_date(opp.response_date.as_deref(), date_style),
        link: opp.display_link().to_string(),
        department: opp.display_department().to_string(),
        notice_id: opp.display_notice_id().to_string(),
        naics: opp.display_naics().to_string(),
        location: opp.display_location(),
        exported_at: exported_at.to_string(),
    }
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, rec: ExportRecord) -> io::Result<()> {
        self.writer.write_record([
            rec.row.to_string(),
            rec.id,
            rec.title,
            rec.description,
            rec.publish_date,
            rec.response_date,
            rec.link,
            rec.department,
            rec.notice_id,
            rec.naics,
            rec.location,
            rec.exported_at,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_record(&mut self, rec: ExportRecord) -> io::Result<()> {
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    fn write_record(&mut self, rec: ExportRecord) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_record(rec),
            OutputSink::Json(sink) => sink.write_record(rec),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

/// Writes `rows` (numbered from `first_row`) to `output_path`.
pub fn write_rows(
    output_path: &str,
    format: DataFormat,
    rows: &[&Opportunity],
    first_row: usize,
    date_style: DateStyle,
) -> io::Result<usize> {
    let exported_at = Utc::now().to_rfc3339();
    let mut sink = OutputSink::new(output_path, format)?;
    for (idx, opp) in rows.iter().enumerate() {
        sink.write_record(opportunity_to_export_record(
            first_row + idx,
            opp,
            date_style,
            &exported_at,
        ))?;
    }
    sink.finalize()?;
    info!(path = output_path, rows = rows.len(), "wrote page dump");
    Ok(rows.len())
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn default_output_path(page: usize, format: DataFormat) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("opportunities_p{page}_{ts}.csv"),
        DataFormat::Json => format!("opportunities_p{page}_{ts}.json"),
    }
}

/// Saves an export payload as `dir/opportunities.xlsx`. The bytes land in a
/// `.part` file first; on any failure it is removed so no partial file stays.
pub fn save_export(dir: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let target = dir.join(EXPORT_FILE_NAME);
    let partial = dir.join(format!("{EXPORT_FILE_NAME}.part"));
    let written = File::create(&partial).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written.and_then(|()| fs::rename(&partial, &target)) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    Ok(target)
}

pub async fn export_current_data(api: &dyn DashboardApi, dir: &Path) -> Result<PathBuf, ApiError> {
    let bytes = api.export_opportunities().await.inspect_err(|err| {
        warn!(error = %err, "export request failed");
    })?;
    let path = save_export(dir, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "export saved");
    Ok(path)
}

/// Renders a backend date in the chosen style; unparseable values are shown
/// as received and missing ones as the placeholder.
pub fn format_date(raw: Option<&str>, style: DateStyle) -> String {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return PLACEHOLDER.to_string();
    };
    parse_date(raw)
        .map(|date| date.format(style.pattern()).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Cell text for one table row, in the order of `columns.headers()`.
pub fn table_cells(
    row: usize,
    opp: &Opportunity,
    columns: ColumnSet,
    date_style: DateStyle,
) -> Vec<String> {
    let mut cells = vec![
        row.to_string(),
        opp.display_title().to_string(),
        format_date(opp.publish_date.as_deref(), date_style),
        format_date(opp.response_date.as_deref(), date_style),
        opp.display_link().to_string(),
        opp.display_department().to_string(),
    ];
    if columns == ColumnSet::Extended {
        cells.push(opp.display_notice_id().to_string());
        cells.push(opp.display_naics().to_string());
        cells.push(opp.display_location());
    }
    cells
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.date_naive());
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(dt.date());
        }
    }
    ["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y"]
        .into_iter()
        .find_map(|pattern| NaiveDate::parse_from_str(raw, pattern).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::api::testing::FakeApi;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("samdash-io-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn dates_render_in_both_styles() {
        assert_eq!(format_date(Some("2025-03-07"), DateStyle::Us), "03/07/2025");
        assert_eq!(format_date(Some("2025-03-07T10:00:00Z"), DateStyle::Iso), "2025-03-07");
        assert_eq!(
            format_date(Some("Fri, 07 Mar 2025 00:00:00 GMT"), DateStyle::Iso),
            "2025-03-07"
        );
        assert_eq!(format_date(Some("Mar 07, 2025"), DateStyle::Iso), "2025-03-07");
        assert_eq!(format_date(Some("sometime soon"), DateStyle::Us), "sometime soon");
        assert_eq!(format_date(None, DateStyle::Us), PLACEHOLDER);
        assert_eq!(format_date(Some("  "), DateStyle::Us), PLACEHOLDER);
    }

    #[test]
    fn export_lands_under_the_fixed_name() {
        let dir = scratch_dir("save");
        let path = save_export(&dir, b"PK\x03\x04").expect("save");
        assert_eq!(path, dir.join(EXPORT_FILE_NAME));
        assert_eq!(fs::read(&path).expect("read"), b"PK\x03\x04");
        assert!(!dir.join("opportunities.xlsx.part").exists());
    }

    #[tokio::test]
    async fn failed_export_leaves_no_file() {
        let dir = scratch_dir("failed");
        let api = FakeApi::default();
        api.export.lock().expect("lock").push_back(Err(ApiError::Validation(
            "connection refused".to_string(),
        )));
        let err = export_current_data(&api, &dir).await.expect_err("fails");
        assert_eq!(err.to_string(), "connection refused");
        assert!(!dir.join(EXPORT_FILE_NAME).exists());
        assert!(!dir.join("opportunities.xlsx.part").exists());
    }

    #[test]
    fn csv_and_json_dumps_share_the_same_columns() {
        let dir = scratch_dir("dump");
        fs::create_dir_all(&dir).expect("dir");
        let opp = Opportunity {
            id: Some("7".to_string()),
            title: Some("Data hosting".to_string()),
            publish_date: Some("2025-01-02".to_string()),
            ..Opportunity::default()
        };
        let rows = vec![&opp];

        let csv_path = dir.join("page.csv");
        let csv_path = csv_path.to_str().expect("utf8");
        write_rows(csv_path, DataFormat::Csv, &rows, 11, DateStyle::Iso).expect("csv");
        let mut reader = csv::Reader::from_path(csv_path).expect("reader");
        assert_eq!(reader.headers().expect("headers").len(), CSV_HEADERS.len());
        let record = reader.records().next().expect("row").expect("record");
        assert_eq!(&record[0], "11");
        assert_eq!(&record[2], "Data hosting");
        assert_eq!(&record[4], "2025-01-02");
        assert_eq!(&record[7], PLACEHOLDER);

        let json_path = dir.join("page.json");
        let json_path = json_path.to_str().expect("utf8");
        write_rows(json_path, DataFormat::Json, &rows, 1, DateStyle::Us).expect("json");
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json_path).expect("read")).expect("json");
        assert_eq!(parsed[0]["publish_date"], "01/02/2025");
        assert_eq!(parsed[0]["row"], 1);
    }

    #[test]
    fn table_cells_follow_the_column_set() {
        let opp = Opportunity {
            title: Some("Janitorial".to_string()),
            city: Some("Austin".to_string()),
            state: Some("TX".to_string()),
            ..Opportunity::default()
        };
        let standard = table_cells(3, &opp, ColumnSet::Standard, DateStyle::Us);
        assert_eq!(standard.len(), ColumnSet::Standard.headers().len());
        assert_eq!(standard[0], "3");
        assert_eq!(standard[2], PLACEHOLDER);

        let extended = table_cells(3, &opp, ColumnSet::Extended, DateStyle::Us);
        assert_eq!(extended.len(), ColumnSet::Extended.headers().len());
        assert_eq!(extended[8], "Austin, TX");
    }

    #[test]
    fn format_follows_the_extension() {
        assert_eq!(detect_data_format("out.JSON", DataFormat::Csv), DataFormat::Json);
        assert_eq!(detect_data_format("out.csv", DataFormat::Json), DataFormat::Csv);
        assert_eq!(detect_data_format("out", DataFormat::Json), DataFormat::Json);
    }
}
