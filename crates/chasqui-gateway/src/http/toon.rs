//! TOON report rendering: line-oriented `key:value` pairs plus tables
//! introduced by `name[n]{col1,col2}:` followed by n indented CSV rows.
//! Consumers parse this mechanically, the shape is a contract.

pub struct ToonWriter {
    out: String,
}

impl ToonWriter {
    pub fn new() -> Self {
        Self { out: String::new() }
    }

    pub fn kv(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        self.out.push_str(&format!("{key}:{value}\n"));
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.out.push('\n');
        self
    }

    /// `name[n]{col1,col2,…}:` + n rows, two-space indented, CSV. Cell
    /// commas are replaced so the row stays mechanically splittable.
    pub fn table(&mut self, name: &str, columns: &[&str], rows: &[Vec<String>]) -> &mut Self {
        self.out.push_str(&format!(
            "{name}[{}]{{{}}}:\n",
            rows.len(),
            columns.join(",")
        ));
        for row in rows {
            let cells: Vec<String> = row.iter().map(|c| c.replace(',', ";")).collect();
            self.out.push_str(&format!("  {}\n", cells.join(",")));
        }
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

impl Default for ToonWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_lines_and_tables_render() {
        let mut w = ToonWriter::new();
        w.kv("report", "daily")
            .kv("total", 42)
            .blank()
            .table(
                "advisors",
                &["name", "attending"],
                &[
                    vec!["Ana".into(), "2".into()],
                    vec!["Beto".into(), "0".into()],
                ],
            );
        let out = w.finish();
        assert!(out.starts_with("report:daily\ntotal:42\n\n"));
        assert!(out.contains("advisors[2]{name,attending}:\n"));
        assert!(out.contains("  Ana,2\n"));
        assert!(out.contains("  Beto,0\n"));
    }

    #[test]
    fn cell_commas_are_sanitised() {
        let mut w = ToonWriter::new();
        w.table("x", &["a"], &[vec!["uno, dos".into()]]);
        assert!(w.finish().contains("  uno; dos\n"));
    }

    #[test]
    fn empty_table_declares_zero_rows() {
        let mut w = ToonWriter::new();
        w.table("vacia", &["a", "b"], &[]);
        assert_eq!(w.finish(), "vacia[0]{a,b}:\n");
    }
}
