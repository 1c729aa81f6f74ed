//! firepit CLI: a thin command surface over `firepit_store::Session`, for
//! manual testing and scripting rather than production ingestion.

use std::fs;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use firepit_store::adapter::Value;
use firepit_store::Session;
use serde_json::Value as Json;

#[derive(Parser, Debug)]
#[command(name = "firepit")]
#[command(about = "Columnar storage for STIX observations", long_about = None)]
struct Args {
    /// Path/name of database
    #[arg(long, env = "FIREPITDB", default_value = "stix.db", global = true)]
    dbname: String,

    /// Session ID for data separation
    #[arg(long, env = "FIREPITID", default_value = "test-id", global = true)]
    session: String,

    /// Log verbosity
    #[arg(long, env = "LOGLEVEL", default_value = "info", global = true)]
    loglevel: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cache STIX observation data in SQL
    Cache {
        query_id: String,
        filenames: Vec<String>,
    },
    /// Create a view of a subset of cached data
    Extract {
        name: String,
        sco_type: String,
        query_id: String,
        pattern: String,
    },
    /// Create a filtered view of a subset of cached data
    Filter {
        name: String,
        sco_type: String,
        source: String,
        pattern: String,
    },
    /// Perform an operation on a column and name the result
    Assign {
        name: String,
        view: String,
        #[arg(long)]
        op: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Join two views
    Join {
        name: String,
        left_view: String,
        left_on: String,
        right_view: String,
        right_on: String,
    },
    /// Retrieve a view
    Lookup {
        name: String,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Retrieve the values of a STIX object path from a view
    Values { path: String, name: String },
    /// Get all physical type table names
    Tables,
    /// Get all view names
    Views,
    /// Get view data for views (default is all views)
    Viewdata {
        views: Vec<String>,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Get the column names of a view/table
    Columns { name: String },
    /// Get the SCO type of a view/table
    Type { name: String },
    /// Get the schema of a view/table
    Schema { name: String },
    /// Get the count of rows in a view/table
    Count { name: String },
    /// Delete all STIX observation data in this session
    Delete,
    /// Run a raw SQL statement on the database [DANGEROUS!]
    Sql { statement: String },
    /// Set the app-specific data for a view
    SetAppdata { name: String, data: String },
    /// Get the app-specific data for a view
    GetAppdata { name: String },
    /// Load already-shredded records from a JSON file
    Load {
        name: String,
        filename: String,
        #[arg(long)]
        sco_type: Option<String>,
        #[arg(long)]
        query_id: Option<String>,
    },
    /// Enrich existing rows from a JSON file of records
    Reassign { name: String, filename: String },
    /// Union the membership of several views into a new one
    Merge { name: String, views: Vec<String> },
    /// Remove a view's catalog entry
    Remove { name: String },
    /// Rename a view
    Rename { old: String, new: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_new(&args.loglevel)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut session = Session::open(&args.dbname, &args.session).context("opening store")?;

    match args.command {
        Command::Cache { query_id, filenames } => {
            for filename in filenames {
                let text = fs::read_to_string(&filename)
                    .with_context(|| format!("reading {filename}"))?;
                let bundle: Json = serde_json::from_str(&text)?;
                session.cache(&query_id, &bundle)?;
            }
        }
        Command::Extract { name, sco_type, query_id, pattern } => {
            session.extract(&name, &sco_type, &query_id, &pattern)?;
        }
        Command::Filter { name, sco_type, source, pattern } => {
            session.filter(&name, &sco_type, &source, &pattern)?;
        }
        Command::Assign { name, view, op, by, desc, limit } => {
            session.assign(&name, &view, &op, &by, !desc, limit)?;
        }
        Command::Join { name, left_view, left_on, right_view, right_on } => {
            session.join(&name, &left_view, &left_on, &right_view, &right_on)?;
        }
        Command::Lookup { name, limit, offset, format } => {
            let result = session.lookup(&name, limit, Some(offset), None)?;
            print_result(&result, &format);
        }
        Command::Values { path, name } => {
            for v in session.values(&name, &path)? {
                println!("{v}");
            }
        }
        Command::Tables => {
            for t in session.tables()? {
                println!("{t}");
            }
        }
        Command::Views => {
            for v in session.views()? {
                println!("{v}");
            }
        }
        Command::Viewdata { views, format } => {
            let names = if views.is_empty() { session.views()? } else { views };
            let infos = session.view_data(&names)?;
            if format == "json" {
                let rows: Vec<_> = infos
                    .iter()
                    .map(|i| {
                        serde_json::json!({
                            "name": i.name,
                            "type": i.sco_type,
                            "appdata": i.appdata.as_ref().map(|b| String::from_utf8_lossy(b).to_string()),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string(&rows)?);
            } else {
                for i in &infos {
                    println!("{}\t{}\t{:?}", i.name, i.sco_type, i.appdata);
                }
            }
        }
        Command::Columns { name } => {
            for c in session.columns(&name)? {
                println!("{c}");
            }
        }
        Command::Type { name } => {
            println!("{}", session.table_type(&name)?);
        }
        Command::Schema { name } => {
            for (col, ty) in session.schema(&name)? {
                println!("{col}\t{ty:?}");
            }
        }
        Command::Count { name } => {
            println!("{}", session.count(&name)?);
        }
        Command::Delete => {
            session.delete()?;
        }
        Command::Sql { statement } => {
            let result = session.sql(&statement, &[])?;
            print_result(&result, "table");
        }
        Command::SetAppdata { name, data } => {
            session.set_appdata(&name, data.as_bytes())?;
        }
        Command::GetAppdata { name } => {
            match session.get_appdata(&name)? {
                Some(blob) => println!("{}", String::from_utf8_lossy(&blob)),
                None => println!("null"),
            }
        }
        Command::Load { name, filename, sco_type, query_id } => {
            let text = fs::read_to_string(&filename).with_context(|| format!("reading {filename}"))?;
            let records = parse_records(&text)?;
            session.load(&name, &records, sco_type.as_deref(), query_id.as_deref())?;
        }
        Command::Reassign { name, filename } => {
            let text = fs::read_to_string(&filename).with_context(|| format!("reading {filename}"))?;
            let records = parse_records(&text)?;
            session.reassign(&name, &records)?;
        }
        Command::Merge { name, views } => {
            session.merge(&name, &views)?;
        }
        Command::Remove { name } => {
            session.remove(&name)?;
        }
        Command::Rename { old, new } => {
            session.rename(&old, &new)?;
        }
    }

    Ok(())
}

fn parse_records(text: &str) -> Result<Vec<std::collections::BTreeMap<String, Json>>> {
    let value: Json = serde_json::from_str(text)?;
    let objects = match value {
        Json::Array(items) => items,
        Json::Object(map) => match map.get("objects") {
            Some(Json::Array(items)) => items.clone(),
            _ => vec![Json::Object(map)],
        },
        other => vec![other],
    };
    objects
        .into_iter()
        .map(|v| {
            v.as_object()
                .cloned()
                .map(|m| m.into_iter().collect())
                .context("record is not a JSON object")
        })
        .collect()
}

fn print_result(result: &firepit_store::QueryResult, format: &str) {
    if format == "json" {
        let rows: Vec<_> = result.as_maps();
        let rendered: Vec<_> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(k, v)| (k.clone(), value_to_json(v)))
                    .collect::<serde_json::Map<_, _>>()
            })
            .collect();
        println!("{}", serde_json::to_string(&rendered).unwrap_or_default());
        return;
    }
    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
}

fn value_to_json(v: &Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Integer(i) => Json::Number((*i).into()),
        Value::Real(r) => serde_json::Number::from_f64(*r).map(Json::Number).unwrap_or(Json::Null),
        Value::Boolean(b) => Json::Bool(*b),
        Value::Text(s) => Json::String(s.clone()),
    }
}
