use colored::*;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use serde_json::{json, Value};

use llamabridge::gguf::{GGUFReader, GGUFValue};
use llamabridge::ModelInfo;

/// Array values longer than this are summarized in tables
const MAX_ARRAY_PREVIEW: usize = 8;

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).fg(Color::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

fn new_table(names: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .set_header(header(names))
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Displays the metadata and tensor directory of a GGUF file.
///
/// # Arguments
///
/// * `reader` - Parsed GGUF header
pub fn display_gguf(reader: &GGUFReader) {
    println!(
        "\n{} {} {}",
        "GGUF".bright_green().bold(),
        format!("v{}", reader.version).bright_black(),
        reader.path.display()
    );

    let mut metadata = new_table(&["Key", "Type", "Value"]);
    for (key, (type_name, value)) in &reader.metadata {
        metadata.add_row(vec![
            Cell::new(key).fg(Color::Yellow),
            Cell::new(type_name).fg(Color::Magenta).set_alignment(CellAlignment::Center),
            Cell::new(preview(value)).fg(Color::White),
        ]);
    }
    println!("\n{}", metadata);

    let mut tensors = new_table(&["Name", "Shape", "Type", "Elements", "Offset"]);
    for tensor in &reader.tensors {
        let shape = tensor
            .dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" x ");
        tensors.add_row(vec![
            Cell::new(&tensor.name).fg(Color::Green),
            Cell::new(shape).set_alignment(CellAlignment::Center),
            Cell::new(tensor.data_type.type_string()).fg(Color::Blue).set_alignment(CellAlignment::Center),
            Cell::new(tensor.element_count().map_or_else(|| "overflow".to_string(), |n| n.to_string()))
                .set_alignment(CellAlignment::Right),
            Cell::new(tensor.offset).fg(Color::DarkGrey).set_alignment(CellAlignment::Right),
        ]);
    }
    println!("\n{}", tensors);
    println!(
        "{}",
        format!("{} metadata entries, {} tensors", reader.metadata.len(), reader.tensors.len()).bright_green()
    );
}

fn preview(value: &GGUFValue) -> String {
    match value {
        GGUFValue::Array(items) if items.len() > MAX_ARRAY_PREVIEW => {
            let head: Vec<String> = items[..MAX_ARRAY_PREVIEW].iter().map(preview).collect();
            format!("[{}, ... {} more]", head.join(", "), items.len() - MAX_ARRAY_PREVIEW)
        }
        GGUFValue::Array(items) => {
            format!("[{}]", items.iter().map(preview).collect::<Vec<_>>().join(", "))
        }
        GGUFValue::String(s) => s.clone(),
        GGUFValue::Int(i) => i.to_string(),
        GGUFValue::Float(f) => f.to_string(),
        GGUFValue::Bool(b) => b.to_string(),
    }
}

fn to_json(value: &GGUFValue) -> Value {
    match value {
        GGUFValue::String(s) => json!(s),
        GGUFValue::Int(i) => json!(i),
        GGUFValue::Float(f) => json!(f),
        GGUFValue::Bool(b) => json!(b),
        GGUFValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
    }
}

/// Same content as [`display_gguf`], as one JSON document.
pub fn gguf_json(reader: &GGUFReader) -> Value {
    let metadata: serde_json::Map<String, Value> = reader
        .metadata
        .iter()
        .map(|(key, (_, value))| (key.clone(), to_json(value)))
        .collect();
    json!({
        "path": reader.path,
        "version": reader.version,
        "metadata": metadata,
        "tensors": reader.tensors,
    })
}

/// One-line summary printed after a model loads.
pub fn display_model_info(info: &ModelInfo) {
    println!(
        "{} {} ({}, {} tokens, engine {})",
        "Loaded".bright_green().bold(),
        info.name.yellow(),
        info.architecture,
        info.n_vocab,
        info.engine.cyan()
    );
}
