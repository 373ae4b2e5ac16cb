//! Lazy record parser for bulk input.
//!
//! Delimited input (CSV, TSV) is read one row at a time from an `AsyncRead`
//! source, so memory use is bounded by a single raw row regardless of input
//! size. Excel workbooks are zip archives and cannot be read incrementally:
//! the upload is buffered up to a size limit and the first worksheet is then
//! walked row by row. Either way columns are located by header name through a
//! [`ColumnMapping`], never by position.
//!
//! Row-level problems (wrong field count, invalid UTF-8, bad size, error
//! cells) surface as [`ParseItem::RowError`] and parsing continues. A failure
//! of the underlying stream surfaces once as [`ParseItem::StreamError`] and
//! ends the sequence.

use std::io::Cursor;
use std::str::FromStr;

use calamine::{Data, Range, Reader, Xlsx};
use csv_async::{AsyncReader, AsyncReaderBuilder, ErrorKind, StringRecord, Trim};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ColumnMapping;
use crate::domain::record::{FileRecord, RowIndex};
use crate::error::{HopperError, Result};

/// Largest workbook buffered when no explicit limit is given (64 MiB).
pub const DEFAULT_MAX_SPREADSHEET_BYTES: u64 = 64 * 1024 * 1024;

/// Supported bulk input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Tsv,
    /// Office Open XML workbook; the first worksheet is read
    Xlsx,
}

impl InputFormat {
    /// Resolve from a MIME type or a file extension.
    ///
    /// Content-type parameters such as `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches('.')
            .to_lowercase();

        match essence.as_str() {
            "csv" | "text/csv" | "application/csv" => Ok(InputFormat::Csv),
            "tsv" | "text/tab-separated-values" => Ok(InputFormat::Tsv),
            "xlsx" | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Ok(InputFormat::Xlsx)
            }
            "xls" | "application/vnd.ms-excel" => Err(HopperError::UnsupportedFormat(format!(
                "{} (legacy Excel workbooks are not supported, save as .xlsx)",
                essence
            ))),
            other => Err(HopperError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Resolve from the extension of a path, e.g. `uploads/batch.tsv`.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| HopperError::UnsupportedFormat(path.display().to_string()))?;
        Self::from_content_type(extension)
    }

    /// Field delimiter, for delimited formats only.
    pub fn delimiter(&self) -> Option<u8> {
        match self {
            InputFormat::Csv => Some(b','),
            InputFormat::Tsv => Some(b'\t'),
            InputFormat::Xlsx => None,
        }
    }
}

impl FromStr for InputFormat {
    type Err = HopperError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_content_type(s)
    }
}

/// One element of the parsed sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseItem {
    Record(FileRecord),
    /// The row at `row_index` could not be turned into a record
    RowError { row_index: RowIndex, reason: String },
    /// The input stream failed; no more items follow
    StreamError(String),
}

/// Header positions of the mapped columns.
#[derive(Debug, Clone, Copy)]
struct ColumnIndices {
    file_type: usize,
    size_bytes: usize,
    filename: usize,
    document_name: usize,
}

impl ColumnIndices {
    fn resolve(headers: &[&str], mapping: &ColumnMapping) -> Result<Self> {
        let find = |wanted: &str| {
            let wanted = wanted.trim();
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(wanted))
                .ok_or_else(|| HopperError::MissingColumn(wanted.to_string()))
        };

        Ok(Self {
            file_type: find(&mapping.file_type)?,
            size_bytes: find(&mapping.size_bytes)?,
            filename: find(&mapping.filename)?,
            document_name: find(&mapping.document_name)?,
        })
    }

    fn build_record<'f>(
        &self,
        row_index: RowIndex,
        field: impl Fn(usize) -> &'f str,
    ) -> ParseItem {
        let raw_size = field(self.size_bytes);
        let size_bytes = match raw_size.parse::<u64>() {
            Ok(size) => size,
            Err(_) => {
                return ParseItem::RowError {
                    row_index,
                    reason: format!("invalid file size '{}'", raw_size),
                };
            }
        };

        ParseItem::Record(FileRecord::new(
            row_index,
            field(self.file_type),
            size_bytes,
            field(self.filename),
            field(self.document_name),
        ))
    }
}

enum Source<R> {
    Delimited {
        reader: AsyncReader<R>,
        row: StringRecord,
    },
    Sheet {
        range: Range<Data>,
        /// Next data row, relative to the header row at 0
        next_row: usize,
    },
}

/// Pull-based parser over a bulk upload.
pub struct RecordParser<R> {
    source: Source<R>,
    columns: ColumnIndices,
    row_index: RowIndex,
    done: bool,
}

impl<R> RecordParser<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read the header row and resolve the mapped columns.
    ///
    /// Fails if the header cannot be read or a mapped column is missing.
    pub async fn new(input: R, format: InputFormat, mapping: &ColumnMapping) -> Result<Self> {
        Self::with_spreadsheet_limit(input, format, mapping, DEFAULT_MAX_SPREADSHEET_BYTES).await
    }

    /// Like [`new`](Self::new), refusing workbooks larger than
    /// `max_spreadsheet_bytes`. The limit does not apply to delimited input.
    pub async fn with_spreadsheet_limit(
        input: R,
        format: InputFormat,
        mapping: &ColumnMapping,
        max_spreadsheet_bytes: u64,
    ) -> Result<Self> {
        let (source, columns) = match format.delimiter() {
            Some(delimiter) => open_delimited(input, delimiter, mapping).await?,
            None => open_sheet(input, mapping, max_spreadsheet_bytes).await?,
        };

        tracing::debug!(?format, ?columns, "Resolved input columns");

        Ok(Self {
            source,
            columns,
            row_index: 0,
            done: false,
        })
    }

    /// Number of data rows read so far, including rows that failed.
    pub fn rows_read(&self) -> RowIndex {
        self.row_index
    }

    /// Next item, or `None` at end of input or after a stream error.
    pub async fn next_item(&mut self) -> Option<ParseItem> {
        if self.done {
            return None;
        }

        let item = match &mut self.source {
            Source::Delimited { reader, row } => match reader.read_record(row).await {
                Ok(false) => None,
                Ok(true) => {
                    self.row_index += 1;
                    let row: &StringRecord = row;
                    Some(
                        self.columns
                            .build_record(self.row_index, |index| row.get(index).unwrap_or_default()),
                    )
                }
                Err(e) => match e.kind() {
                    ErrorKind::Io(io_error) => {
                        self.done = true;
                        tracing::warn!(rows_read = self.row_index, error = %io_error, "Input stream failed");
                        return Some(ParseItem::StreamError(io_error.to_string()));
                    }
                    _ => {
                        self.row_index += 1;
                        Some(ParseItem::RowError {
                            row_index: self.row_index,
                            reason: e.to_string(),
                        })
                    }
                },
            },
            Source::Sheet { range, next_row } => {
                next_sheet_item(range, next_row, &self.columns, &mut self.row_index)
            }
        };

        if item.is_none() {
            self.done = true;
        }
        item
    }

    /// Consume the parser as a stream of items.
    pub fn into_stream(self) -> impl Stream<Item = ParseItem> + Send {
        futures::stream::unfold(self, |mut parser| async move {
            parser.next_item().await.map(|item| (item, parser))
        })
    }
}

async fn open_delimited<R>(
    input: R,
    delimiter: u8,
    mapping: &ColumnMapping,
) -> Result<(Source<R>, ColumnIndices)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = AsyncReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(Trim::All)
        .create_reader(input);

    let header_record = reader.headers().await?.clone();
    let headers: Vec<&str> = header_record.iter().collect();
    let columns = ColumnIndices::resolve(&headers, mapping)?;

    let source = Source::Delimited {
        reader,
        row: StringRecord::new(),
    };
    Ok((source, columns))
}

async fn open_sheet<R>(
    input: R,
    mapping: &ColumnMapping,
    max_bytes: u64,
) -> Result<(Source<R>, ColumnIndices)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buffer = Vec::new();
    input.take(max_bytes.saturating_add(1)).read_to_end(&mut buffer).await?;
    if buffer.len() as u64 > max_bytes {
        return Err(HopperError::StreamParse(format!(
            "spreadsheet exceeds {} bytes",
            max_bytes
        )));
    }

    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(buffer))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range?,
        None => return Err(HopperError::StreamParse("workbook has no worksheets".to_string())),
    };

    let header_cells: Vec<String> = (0..range.width())
        .map(|column| range.get((0, column)).map(cell_text).unwrap_or_default())
        .collect();
    let headers: Vec<&str> = header_cells.iter().map(String::as_str).collect();
    let columns = ColumnIndices::resolve(&headers, mapping)?;

    tracing::debug!(rows = range.height().saturating_sub(1), "Loaded worksheet");
    Ok((Source::Sheet { range, next_row: 1 }, columns))
}

/// Advance to the next non-blank worksheet row.
fn next_sheet_item(
    range: &Range<Data>,
    next_row: &mut usize,
    columns: &ColumnIndices,
    row_index: &mut RowIndex,
) -> Option<ParseItem> {
    while *next_row < range.height() {
        let row = *next_row;
        *next_row += 1;

        let cells: Vec<&Data> = (0..range.width())
            .map(|column| range.get((row, column)).unwrap_or(&Data::Empty))
            .collect();
        if cells.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }

        *row_index += 1;
        if let Some(error) = cells.iter().find_map(|cell| match cell {
            Data::Error(error) => Some(error),
            _ => None,
        }) {
            return Some(ParseItem::RowError {
                row_index: *row_index,
                reason: format!("cell error {}", error),
            });
        }

        let texts: Vec<String> = cells.into_iter().map(cell_text).collect();
        return Some(columns.build_record(*row_index, |index| {
            texts.get(index).map(String::as_str).unwrap_or_default()
        }));
    }
    None
}

/// Cell value as the text a delimited upload would carry.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.trim().to_string(),
        // Whole numbers are stored as floats
        Data::Float(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
            format!("{}", *value as i64)
        }
        other => other.to_string().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, ReadBuf};

    const HEADER: &str = "file_type,file_size,file_name,document_name\n";

    async fn parse_all(input: &'static str, format: InputFormat) -> Vec<ParseItem> {
        let parser = RecordParser::new(input.as_bytes(), format, &ColumnMapping::default())
            .await
            .unwrap();
        parser.into_stream().collect().await
    }

    fn record(item: &ParseItem) -> &FileRecord {
        match item {
            ParseItem::Record(record) => record,
            other => panic!("Expected record, got {:?}", other),
        }
    }

    /// Reader that fails on every read
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")))
        }
    }

    #[test]
    fn test_format_resolution() {
        assert_eq!(InputFormat::from_content_type("text/csv").unwrap(), InputFormat::Csv);
        assert_eq!(
            InputFormat::from_content_type("text/csv; charset=utf-8").unwrap(),
            InputFormat::Csv
        );
        assert_eq!("application/csv".parse::<InputFormat>().unwrap(), InputFormat::Csv);
        assert_eq!("TSV".parse::<InputFormat>().unwrap(), InputFormat::Tsv);
        assert_eq!(
            InputFormat::from_path(std::path::Path::new("uploads/batch.tsv")).unwrap(),
            InputFormat::Tsv
        );

        assert_eq!("XLSX".parse::<InputFormat>().unwrap(), InputFormat::Xlsx);
        assert_eq!(
            InputFormat::from_path(std::path::Path::new("uploads/batch.xlsx")).unwrap(),
            InputFormat::Xlsx
        );

        for unsupported in ["xls", "application/vnd.ms-excel", "application/json", ""] {
            assert!(
                matches!(
                    InputFormat::from_content_type(unsupported),
                    Err(HopperError::UnsupportedFormat(_))
                ),
                "{:?} should be unsupported",
                unsupported
            );
        }
    }

    #[tokio::test]
    async fn test_parses_rows_in_order() {
        let input = "file_type,file_size,file_name,document_name\n\
                     pdf,1024,a.pdf,Annual report\n\
                     docx, 2048 , b.docx ,Budget\n";
        let items = parse_all(input, InputFormat::Csv).await;

        assert_eq!(items.len(), 2);
        let first = record(&items[0]);
        assert_eq!(first.row_index, 1);
        assert_eq!(first.file_type, "pdf");
        assert_eq!(first.size_bytes, 1024);
        assert_eq!(first.filename, "a.pdf");
        assert_eq!(first.document_name, "Annual report");

        let second = record(&items[1]);
        assert_eq!(second.row_index, 2);
        assert_eq!(second.size_bytes, 2048);
        assert_eq!(second.filename, "b.docx");
    }

    #[tokio::test]
    async fn test_columns_resolved_by_name() {
        let input = "Document_Name\tFILE_NAME\tfile_size\tfile_type\textra\n\
                     Notes\tnotes.txt\t12\ttxt\tignored\n";
        let items = parse_all(input, InputFormat::Tsv).await;

        let parsed = record(&items[0]);
        assert_eq!(parsed.file_type, "txt");
        assert_eq!(parsed.size_bytes, 12);
        assert_eq!(parsed.filename, "notes.txt");
        assert_eq!(parsed.document_name, "Notes");
    }

    #[tokio::test]
    async fn test_custom_mapping_and_missing_column() {
        let mapping = ColumnMapping {
            file_type: "kind".to_string(),
            ..ColumnMapping::default()
        };
        let input = "kind,file_size,file_name,document_name\npng,5,x.png,X\n";
        let mut parser = RecordParser::new(input.as_bytes(), InputFormat::Csv, &mapping)
            .await
            .unwrap();
        assert_eq!(record(&parser.next_item().await.unwrap()).file_type, "png");
        assert!(parser.next_item().await.is_none());

        let result = RecordParser::new(HEADER.as_bytes(), InputFormat::Csv, &mapping).await;
        assert!(matches!(result, Err(HopperError::MissingColumn(column)) if column == "kind"));
    }

    #[tokio::test]
    async fn test_row_errors_do_not_stop_parsing() {
        let input = "file_type,file_size,file_name,document_name\n\
                     pdf,10,a.pdf,A\n\
                     pdf,abc,b.pdf,B\n\
                     pdf,-5,c.pdf,C\n\
                     pdf,10,d.pdf\n\
                     pdf,40,e.pdf,E\n";
        let items = parse_all(input, InputFormat::Csv).await;

        assert_eq!(items.len(), 5);
        assert_eq!(record(&items[0]).row_index, 1);
        for (item, expected_row) in items[1..4].iter().zip(2..) {
            match item {
                ParseItem::RowError { row_index, .. } => assert_eq!(*row_index, expected_row),
                other => panic!("Expected row error, got {:?}", other),
            }
        }
        assert!(matches!(
            &items[1],
            ParseItem::RowError { reason, .. } if reason.contains("invalid file size 'abc'")
        ));
        assert_eq!(record(&items[4]).row_index, 5);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_row_error() {
        let mut input = HEADER.as_bytes().to_vec();
        input.extend_from_slice(b"pdf,10,\xff\xfe.pdf,Broken\n");
        input.extend_from_slice(b"pdf,20,ok.pdf,Fine\n");

        let parser = RecordParser::new(&input[..], InputFormat::Csv, &ColumnMapping::default())
            .await
            .unwrap();
        let items: Vec<_> = parser.into_stream().collect().await;

        assert!(matches!(items[0], ParseItem::RowError { row_index: 1, .. }));
        assert_eq!(record(&items[1]).filename, "ok.pdf");
        assert_eq!(record(&items[1]).row_index, 2);
    }

    #[tokio::test]
    async fn test_stream_failure_ends_sequence() {
        let input = "file_type,file_size,file_name,document_name\npdf,10,a.pdf,A\n";
        let source = input.as_bytes().chain(BrokenPipe);

        let mut parser = RecordParser::new(source, InputFormat::Csv, &ColumnMapping::default())
            .await
            .unwrap();

        assert_eq!(record(&parser.next_item().await.unwrap()).filename, "a.pdf");
        match parser.next_item().await {
            Some(ParseItem::StreamError(reason)) => assert!(reason.contains("connection reset")),
            other => panic!("Expected stream error, got {:?}", other),
        }
        assert!(parser.next_item().await.is_none());
        assert_eq!(parser.rows_read(), 1);
    }

    /// Build an xlsx workbook; numeric-looking cells are stored as numbers
    /// and empty ones are left blank.
    fn workbook(rows: &[&[&str]]) -> Vec<u8> {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        {
            let sheet = workbook.add_worksheet();
            for (row, cells) in rows.iter().enumerate() {
                for (column, cell) in cells.iter().enumerate() {
                    if cell.is_empty() {
                        continue;
                    }
                    let written = match cell.parse::<f64>() {
                        Ok(number) => sheet.write_number(row as u32, column as u16, number),
                        Err(_) => sheet.write_string(row as u32, column as u16, *cell),
                    };
                    written.unwrap();
                }
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    #[tokio::test]
    async fn test_xlsx_rows_follow_the_header() {
        let bytes = workbook(&[
            &["Document Name", "file_type", "FILE_SIZE", "file_name"],
            &["Annual report", "pdf", "1024", "a.pdf"],
            &["Bad size", "pdf", "ten", "b.pdf"],
            &["", "", "", ""],
            &["Negative", "pdf", "-5", "c.pdf"],
            &["Photo", "png", "2048", "d.png"],
        ]);
        let mapping = ColumnMapping {
            document_name: "document name".to_string(),
            ..ColumnMapping::default()
        };

        let parser = RecordParser::new(&bytes[..], InputFormat::Xlsx, &mapping)
            .await
            .unwrap();
        let items: Vec<_> = parser.into_stream().collect().await;

        assert_eq!(items.len(), 4);
        let first = record(&items[0]);
        assert_eq!(first.row_index, 1);
        assert_eq!(first.file_type, "pdf");
        assert_eq!(first.size_bytes, 1024);
        assert_eq!(first.filename, "a.pdf");
        assert_eq!(first.document_name, "Annual report");

        assert!(matches!(
            &items[1],
            ParseItem::RowError { row_index: 2, reason } if reason.contains("invalid file size 'ten'")
        ));
        // Blank rows are skipped without consuming a row index
        assert!(matches!(
            &items[2],
            ParseItem::RowError { row_index: 3, reason } if reason.contains("'-5'")
        ));
        let last = record(&items[3]);
        assert_eq!(last.row_index, 4);
        assert_eq!(last.size_bytes, 2048);
        assert_eq!(last.filename, "d.png");
    }

    #[tokio::test]
    async fn test_xlsx_open_failures() {
        let bytes = workbook(&[&["file_type", "file_size", "file_name"], &["pdf", "1", "a.pdf"]]);
        let missing = RecordParser::new(&bytes[..], InputFormat::Xlsx, &ColumnMapping::default()).await;
        assert!(matches!(missing, Err(HopperError::MissingColumn(column)) if column == "document_name"));

        let too_large = RecordParser::with_spreadsheet_limit(
            &bytes[..],
            InputFormat::Xlsx,
            &ColumnMapping::default(),
            16,
        )
        .await;
        assert!(matches!(too_large, Err(HopperError::StreamParse(reason)) if reason.contains("16 bytes")));

        let garbage = RecordParser::new(
            &b"file_type,file_size\n"[..],
            InputFormat::Xlsx,
            &ColumnMapping::default(),
        )
        .await;
        assert!(matches!(garbage, Err(HopperError::Spreadsheet(_))));
    }

    #[tokio::test]
    async fn test_empty_input_is_missing_columns() {
        let result = RecordParser::new(&b""[..], InputFormat::Csv, &ColumnMapping::default()).await;
        assert!(matches!(result, Err(HopperError::MissingColumn(_))));

        let items = parse_all(HEADER, InputFormat::Csv).await;
        assert!(items.is_empty());
    }
}
