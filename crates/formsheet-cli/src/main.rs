//! formsheet CLI - recalculate, check and inspect period fixtures

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use formsheet::prelude::*;
use formsheet::{Coordinate, Sheet};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsheet")]
#[command(
    author,
    version,
    about = "Recalculate, check and inspect formsheet fixtures"
)]
struct Cli {
    /// Log engine activity at debug level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Fixture {
    /// JSON fixture holding sheets, cells, documents and values
    fixture: PathBuf,

    /// Write the updated fixture back to disk
    #[arg(long)]
    save: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply edits to a document and print every recalculated cell
    ///
    /// Without edits, every formula of the document's period is recomputed.
    #[command(alias = "edit")]
    Recalc {
        #[command(flatten)]
        fixture: Fixture,

        /// Document to recalculate
        #[arg(short, long)]
        document: u64,

        /// Value edit, e.g. `Form1!A1=40`
        #[arg(long = "set", value_name = "CELL=VALUE")]
        values: Vec<String>,

        /// Formula edit, e.g. `Form1!C1==A1+B1` (empty formula clears it)
        #[arg(long = "formula", value_name = "CELL=FORMULA")]
        formulas: Vec<String>,
    },

    /// Check a document's limitations
    Check {
        #[command(flatten)]
        fixture: Fixture,

        /// Document to check
        #[arg(short, long)]
        document: u64,
    },

    /// Print the dependency graph of a sheet, or of a period's limitations
    Graph {
        #[command(flatten)]
        fixture: Fixture,

        /// Period the sheet belongs to
        #[arg(short, long)]
        period: u64,

        /// Sheet name (default: the limitation graph)
        #[arg(short, long)]
        sheet: Option<String>,
    },

    /// Replace a period's limitations or aggregation edges from a JSON file
    Import {
        #[command(flatten)]
        fixture: Fixture,

        #[arg(short, long)]
        period: u64,

        /// Limitations file: `[{"form", "check", "message"}]`
        #[arg(long, conflicts_with = "aggregations", required_unless_present = "aggregations")]
        limitations: Option<PathBuf>,

        /// Aggregations file: `[{"to_cell", "aggregation", "from_cells"}]`
        #[arg(long)]
        aggregations: Option<PathBuf>,
    },

    /// Rename a sheet, rewriting every reference to it
    Rename {
        #[command(flatten)]
        fixture: Fixture,

        #[arg(short, long)]
        period: u64,

        /// Current sheet name
        from: String,

        /// New sheet name
        to: String,
    },
}

type CliEngine = Engine<MemoryStorage, MemoryCacheStore>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Recalc {
            fixture,
            document,
            values,
            formulas,
        } => recalc(&fixture, DocumentId(document), &values, &formulas),
        Commands::Check { fixture, document } => check(&fixture, DocumentId(document)),
        Commands::Graph {
            fixture,
            period,
            sheet,
        } => graph(&fixture, PeriodId(period), sheet.as_deref()),
        Commands::Import {
            fixture,
            period,
            limitations,
            aggregations,
        } => import(
            &fixture,
            PeriodId(period),
            limitations.as_deref(),
            aggregations.as_deref(),
        ),
        Commands::Rename {
            fixture,
            period,
            from,
            to,
        } => rename(&fixture, PeriodId(period), &from, &to),
    }
}

/// `RUST_LOG` wins; otherwise warnings, or debug output with `-v`
fn init_logging(verbose: u8) {
    let default = if verbose == 0 { "warn" } else { "debug" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(fixture: &Fixture) -> Result<CliEngine> {
    let storage = MemoryStorage::load(&fixture.fixture)
        .with_context(|| format!("Failed to load '{}'", fixture.fixture.display()))?;
    Ok(Engine::new(storage, MemoryCacheStore::new()))
}

fn finish(engine: CliEngine, fixture: &Fixture) -> Result<()> {
    if fixture.save {
        engine
            .storage()
            .save(&fixture.fixture)
            .with_context(|| format!("Failed to write '{}'", fixture.fixture.display()))?;
        eprintln!("Saved '{}'", fixture.fixture.display());
    }
    Ok(())
}

fn sheet_named(engine: &CliEngine, period: PeriodId, name: &str) -> Result<Sheet> {
    engine
        .storage()
        .sheet_by_name(period, name)?
        .with_context(|| format!("No sheet named '{}' in period {}", name, period))
}

/// Parse `Sheet!A1=rest` into the cell position and the text after the first `=`
fn parse_assignment(engine: &CliEngine, period: PeriodId, text: &str) -> Result<(CellPos, String)> {
    let (cell, rest) = text
        .split_once('=')
        .with_context(|| format!("Expected CELL=VALUE, got '{}'", text))?;
    let coordinate = Coordinate::parse(cell.trim(), None)
        .with_context(|| format!("Invalid cell '{}'", cell))?;
    let scope = coordinate
        .scope
        .as_deref()
        .with_context(|| format!("Cell '{}' must name its sheet", cell))?;
    let sheet = sheet_named(engine, period, scope)?;
    Ok((CellPos::new(sheet.id, coordinate.address), rest.to_string()))
}

fn parse_value(text: &str) -> CellValue {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        CellValue::Empty
    } else if let Ok(n) = trimmed.parse::<f64>() {
        CellValue::Number(n)
    } else if trimmed.eq_ignore_ascii_case("true") {
        CellValue::Boolean(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        CellValue::Boolean(false)
    } else {
        CellValue::text(text)
    }
}

fn describe(engine: &CliEngine, pos: CellPos) -> String {
    match engine.storage().sheet(pos.sheet) {
        Ok(sheet) => Coordinate::qualified(sheet.name, pos.address).to_string(),
        Err(_) => pos.to_string(),
    }
}

fn print_report(engine: &CliEngine, report: &RecalcReport, indent: usize) {
    let pad = " ".repeat(indent);
    println!("{}document {}", pad, report.document);
    for (pos, state) in &report.recalculated {
        let shown = match state {
            CellState::Value(value) => value.to_string(),
            CellState::Error(e) => format!("#ERROR {}", e),
            CellState::Formula(f) => f.clone(),
        };
        println!("{}  {}\t{}", pad, describe(engine, *pos), shown);
    }
    if !report.affected_limitations.is_empty() {
        println!("{}  affected limitations: {:?}", pad, report.affected_limitations);
    }
    for cascaded in &report.cascaded {
        print_report(engine, cascaded, indent + 2);
    }
}

fn recalc(fixture: &Fixture, document: DocumentId, values: &[String], formulas: &[String]) -> Result<()> {
    let mut engine = open(fixture)?;
    let period = engine.storage().document(document)?.period;

    let mut edits = Vec::new();
    for text in values {
        let (pos, value) = parse_assignment(&engine, period, text)?;
        edits.push(CellEdit::value(pos.sheet, pos.address, parse_value(&value)));
    }
    for text in formulas {
        let (pos, formula) = parse_assignment(&engine, period, text)?;
        edits.push(if formula.trim().is_empty() {
            CellEdit::clear_formula(pos.sheet, pos.address)
        } else {
            CellEdit::formula(pos.sheet, pos.address, formula)
        });
    }

    let result = if edits.is_empty() {
        engine.recalculate_document(document)
    } else {
        engine.apply(document, &edits)
    };
    let report = result.context("Recalculation failed")?;

    print_report(&engine, &report, 0);
    eprintln!(
        "Recalculated {} cells ({} errors)",
        report.recalculated.len(),
        report.errors
    );
    finish(engine, fixture)
}

fn check(fixture: &Fixture, document: DocumentId) -> Result<()> {
    let engine = open(fixture)?;
    let failures = engine
        .check_limitations(document)
        .context("Limitation check failed")?;

    if failures.is_empty() {
        println!("All limitations hold");
        return Ok(());
    }
    for failure in &failures {
        println!("{}\t{}", failure.index, failure.message);
    }
    bail!("{} limitation(s) failed", failures.len())
}

fn graph(fixture: &Fixture, period: PeriodId, sheet: Option<&str>) -> Result<()> {
    let engine = open(fixture)?;
    let graph = match sheet {
        Some(name) => {
            let sheet = sheet_named(&engine, period, name)?;
            engine.sheet_cache(sheet.id)?.graph().clone()
        }
        None => engine.limitation_cache(period)?.graph().clone(),
    };
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

fn import(
    fixture: &Fixture,
    period: PeriodId,
    limitations: Option<&Path>,
    aggregations: Option<&Path>,
) -> Result<()> {
    let mut engine = open(fixture)?;
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read '{}'", path.display()))
    };

    if let Some(path) = limitations {
        let count = engine
            .update_limitations_from_file(period, &read(path)?)
            .context("Limitation import failed")?;
        eprintln!("Imported {} limitations", count);
    }
    if let Some(path) = aggregations {
        let count = engine
            .update_aggregations_from_file(period, &read(path)?)
            .context("Aggregation import failed")?;
        eprintln!("Imported {} aggregation edges", count);
    }
    finish(engine, fixture)
}

fn rename(fixture: &Fixture, period: PeriodId, from: &str, to: &str) -> Result<()> {
    let mut engine = open(fixture)?;
    let sheet = sheet_named(&engine, period, from)?;
    engine
        .rename_sheet(sheet.id, to)
        .with_context(|| format!("Failed to rename '{}'", from))?;
    eprintln!("Renamed '{}' to '{}'", sheet.name, to);
    finish(engine, fixture)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("40"), CellValue::Number(40.0));
        assert_eq!(parse_value(" TRUE "), CellValue::Boolean(true));
        assert_eq!(parse_value(""), CellValue::Empty);
        assert_eq!(parse_value("north"), CellValue::text("north"));
    }

    #[test]
    fn test_parse_assignment() {
        let mut storage = MemoryStorage::new();
        storage.add_sheet(PeriodId(1), SheetId(3), "Form1");
        let engine = Engine::new(storage, MemoryCacheStore::new());

        let (pos, rest) = parse_assignment(&engine, PeriodId(1), "form1!C1==A1+B1").unwrap();
        assert_eq!(pos, CellPos::new(SheetId(3), CellAddress::parse("C1").unwrap()));
        assert_eq!(rest, "=A1+B1");

        assert!(parse_assignment(&engine, PeriodId(1), "C1=4").is_err());
        assert!(parse_assignment(&engine, PeriodId(1), "Other!C1=4").is_err());
    }
}
