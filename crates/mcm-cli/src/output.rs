use clap::ValueEnum;
use serde::Serialize;
use tabled::Tabled;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default).
    #[default]
    Table,
    /// JSON output of the underlying records.
    Json,
}

fn print_table<R: Tabled>(rows: Vec<R>) {
    if rows.is_empty() {
        println!("(none)");
        return;
    }
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

/// Render a list: as table rows built by `to_row`, or as the records
/// themselves in JSON.
pub fn render_list<T, R, F>(items: &[T], format: OutputFormat, to_row: F)
where
    T: Serialize,
    R: Tabled,
    F: Fn(&T) -> R,
{
    match format {
        OutputFormat::Table => print_table(items.iter().map(to_row).collect()),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(items).unwrap_or_default()
            );
        }
    }
}

/// Render a single item in the specified output format.
pub fn render_one<T, R, F>(item: &T, format: OutputFormat, to_row: F)
where
    T: Serialize,
    R: Tabled,
    F: Fn(&T) -> R,
{
    match format {
        OutputFormat::Table => print_table(vec![to_row(item)]),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "NAME")]
        name: String,
    }

    fn row(r: &Record) -> Row {
        Row {
            name: format!("{} ({})", r.name, r.count),
        }
    }

    #[test]
    fn test_output_format_from_arg() {
        assert_eq!(OutputFormat::from_str("json", true), Ok(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("JSON", true), Ok(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("table", true), Ok(OutputFormat::Table));
        assert!(OutputFormat::from_str("yaml", true).is_err());
    }

    #[test]
    fn test_render_list_both_formats() {
        let items = vec![
            Record {
                name: "a".to_string(),
                count: 1,
            },
            Record {
                name: "b".to_string(),
                count: 2,
            },
        ];
        // Just verify it doesn't panic
        render_list(&items, OutputFormat::Table, row);
        render_list(&items, OutputFormat::Json, row);
    }

    #[test]
    fn test_render_empty_list() {
        let items: Vec<Record> = vec![];
        render_list(&items, OutputFormat::Table, row);
    }

    #[test]
    fn test_render_one_json() {
        let item = Record {
            name: "z".to_string(),
            count: 7,
        };
        render_one(&item, OutputFormat::Json, row);
    }
}
