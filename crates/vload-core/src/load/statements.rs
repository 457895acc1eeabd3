//! Rendering of the bulk-load statement.

/// Separator between file paths in the load URL list.
const FILE_LIST_SEPARATOR: &str = "|";

/// Map one entry reference to the path the cluster hosts read it from.
///
/// Entries keep the object key as delivered, where a space arrives as `+`
/// and a literal plus as `%2B`.
pub fn mounted_path(mount_dir: &str, entry: &str) -> String {
    let decoded = entry.replace('+', " ").replace("%2B", "+");
    format!("{mount_dir}{decoded}")
}

/// `|`-joined list of mounted paths for every entry.
pub fn file_list(mount_dir: &str, entries: &[String]) -> String {
    entries
        .iter()
        .map(|entry| mounted_path(mount_dir, entry))
        .collect::<Vec<_>>()
        .join(FILE_LIST_SEPARATOR)
}

/// `COPY <table> [(<columns>)] SOURCE S3(url='<file list>')[ <options>]`
pub fn copy_statement(
    table: &str,
    columns: Option<&str>,
    file_list: &str,
    copy_options: Option<&str>,
) -> String {
    let mut statement = format!("COPY {table}");
    if let Some(columns) = columns.map(str::trim).filter(|c| !c.is_empty()) {
        statement.push_str(" (");
        statement.push_str(columns);
        statement.push(')');
    }
    statement.push_str(" SOURCE S3(url='");
    statement.push_str(file_list);
    statement.push_str("')");
    if let Some(options) = copy_options.map(str::trim).filter(|o| !o.is_empty()) {
        statement.push(' ');
        statement.push_str(options);
    }
    statement
}
