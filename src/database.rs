use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::info;

use crate::error::{Error, Result};
use crate::page::Page;
use crate::table::{Location, Table, VersionEntry};
use crate::Rid;

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_bool(r: &mut impl Read) -> Result<bool> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

/// A table catalog with an on-disk lifecycle: `metadata.db` lists every
/// table, and each table gets its own subdirectory of per-column page
/// directories plus a page-directory and version-chain file.
///
/// Both fields are plain mutexes rather than reentrant ones: no method
/// here calls back into another `Database` method while holding one.
pub struct Database {
    path: Mutex<Option<PathBuf>>,
    tables: Mutex<Vec<Arc<Table>>>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            path: Mutex::new(None),
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Opens `path`, creating it if it does not yet exist. If it exists
    /// but carries no `metadata.db`, this is a fresh, empty database at
    /// that location. Otherwise every listed table and its pages, page
    /// directory, and version chain are loaded, and its primary-key index
    /// is rebuilt from the loaded page directory.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        *self.path.lock().unwrap() = Some(path.clone());

        if !path.exists() {
            fs::create_dir_all(&path)?;
            return Ok(());
        }

        let metadata_path = path.join("metadata.db");
        if !metadata_path.exists() {
            return Ok(());
        }

        let mut reader = BufReader::new(File::open(&metadata_path)?);
        let num_tables = read_i32(&mut reader)?;
        let mut tables = Vec::with_capacity(num_tables.max(0) as usize);
        for _ in 0..num_tables {
            let name_len = read_i32(&mut reader)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            reader.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|e| Error::Corrupt(format!("table name is not valid utf-8: {}", e)))?;
            let num_columns = read_i32(&mut reader)? as usize;
            let key_col = read_i32(&mut reader)? as usize;

            let table = Table::new(&name, num_columns, key_col);
            Self::load_table_data(&path, &table)?;
            tables.push(Arc::new(table));
        }

        info!("opened database at {} with {} tables", path.display(), tables.len());
        *self.tables.lock().unwrap() = tables;
        Ok(())
    }

    fn load_table_data(root: &Path, table: &Table) -> Result<()> {
        let table_path = root.join(table.name());
        if !table_path.exists() {
            return Ok(());
        }

        for col in 0..table.num_columns() {
            let dir = table_path.join(format!("base_col_{}", col));
            table.set_base_pages(col, Self::load_pages(&dir)?);
        }
        for col in 0..table.num_columns() {
            let dir = table_path.join(format!("tail_col_{}", col));
            table.set_tail_pages(col, Self::load_pages(&dir)?);
        }

        Self::load_page_directory(&table_path, table)?;
        Self::load_version_chains(&table_path, table)?;
        table.rebuild_key_index();
        Ok(())
    }

    fn load_pages(dir: &Path) -> Result<Vec<Page>> {
        if !dir.exists() {
            return Ok(vec![Page::new()]);
        }

        let mut numbered: Vec<(usize, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("dat") {
                    return None;
                }
                let stem = path.file_stem()?.to_str()?.to_string();
                let number: usize = stem.strip_prefix("page_")?.parse().ok()?;
                Some((number, path))
            })
            .collect();
        numbered.sort_by_key(|(n, _)| *n);

        if numbered.is_empty() {
            return Ok(vec![Page::new()]);
        }

        numbered
            .into_iter()
            .map(|(_, path)| Page::from_bytes(&fs::read(path)?))
            .collect()
    }

    fn load_page_directory(table_path: &Path, table: &Table) -> Result<()> {
        let pd_path = table_path.join("page_directory.dat");
        if !pd_path.exists() {
            return Ok(());
        }

        let mut reader = BufReader::new(File::open(pd_path)?);
        let num_entries = read_i32(&mut reader)?;
        let mut pd: HashMap<Rid, Vec<Location>> = HashMap::with_capacity(num_entries.max(0) as usize);
        for _ in 0..num_entries {
            let rid = read_i64(&mut reader)? as Rid;
            let mut positions = Vec::with_capacity(table.num_columns());
            for _ in 0..table.num_columns() {
                let page_idx = read_i32(&mut reader)? as usize;
                let slot_idx = read_i32(&mut reader)? as usize;
                positions.push((page_idx, slot_idx));
            }
            pd.insert(rid, positions);
        }
        table.set_page_directory(pd);
        Ok(())
    }

    fn load_version_chains(table_path: &Path, table: &Table) -> Result<()> {
        let vc_path = table_path.join("version_chains.dat");
        if !vc_path.exists() {
            return Ok(());
        }

        let mut reader = BufReader::new(File::open(vc_path)?);
        let num_rids = read_i32(&mut reader)?;
        let mut vc: HashMap<Rid, Vec<VersionEntry>> = HashMap::with_capacity(num_rids.max(0) as usize);
        for _ in 0..num_rids {
            let rid = read_i64(&mut reader)? as Rid;
            let num_versions = read_i32(&mut reader)?;
            let mut versions = Vec::with_capacity(num_versions.max(0) as usize);
            for _ in 0..num_versions {
                let mut entry: VersionEntry = Vec::with_capacity(table.num_columns());
                for _ in 0..table.num_columns() {
                    if read_bool(&mut reader)? {
                        let page_idx = read_i32(&mut reader)? as usize;
                        let slot_idx = read_i32(&mut reader)? as usize;
                        entry.push(Some((page_idx, slot_idx)));
                    } else {
                        entry.push(None);
                    }
                }
                versions.push(entry);
            }
            vc.insert(rid, versions);
        }
        table.set_version_chain(vc);
        Ok(())
    }

    /// Writes every table's pages, page directory, and version chain to
    /// the path passed to `open`. A no-op if `open` was never called.
    pub fn close(&self) -> Result<()> {
        let path = match self.path.lock().unwrap().clone() {
            Some(path) => path,
            None => return Ok(()),
        };
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }

        let tables = self.tables.lock().unwrap();

        let mut writer = BufWriter::new(File::create(path.join("metadata.db"))?);
        writer.write_all(&(tables.len() as i32).to_le_bytes())?;
        for table in tables.iter() {
            let name_bytes = table.name().as_bytes();
            writer.write_all(&(name_bytes.len() as i32).to_le_bytes())?;
            writer.write_all(name_bytes)?;
            writer.write_all(&(table.num_columns() as i32).to_le_bytes())?;
            writer.write_all(&(table.key_col() as i32).to_le_bytes())?;
        }
        writer.flush()?;

        for table in tables.iter() {
            Self::save_table_data(&path, table)?;
        }

        info!("closed database at {} with {} tables", path.display(), tables.len());
        Ok(())
    }

    fn save_table_data(root: &Path, table: &Table) -> Result<()> {
        let table_path = root.join(table.name());
        fs::create_dir_all(&table_path)?;

        for col in 0..table.num_columns() {
            let dir = table_path.join(format!("base_col_{}", col));
            Self::save_pages(&dir, &table.base_pages(col))?;
        }
        for col in 0..table.num_columns() {
            let dir = table_path.join(format!("tail_col_{}", col));
            Self::save_pages(&dir, &table.tail_pages(col))?;
        }

        Self::save_page_directory(&table_path, table)?;
        Self::save_version_chains(&table_path, table)?;
        Ok(())
    }

    fn save_pages(dir: &Path, pages: &[Arc<Page>]) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (idx, page) in pages.iter().enumerate() {
            fs::write(dir.join(format!("page_{}.dat", idx)), page.to_bytes())?;
        }
        Ok(())
    }

    fn save_page_directory(table_path: &Path, table: &Table) -> Result<()> {
        let pd = table.page_directory_snapshot();
        let mut writer = BufWriter::new(File::create(table_path.join("page_directory.dat"))?);
        writer.write_all(&(pd.len() as i32).to_le_bytes())?;
        for (rid, positions) in pd.iter() {
            writer.write_all(&(*rid as i64).to_le_bytes())?;
            for &(page_idx, slot_idx) in positions {
                writer.write_all(&(page_idx as i32).to_le_bytes())?;
                writer.write_all(&(slot_idx as i32).to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn save_version_chains(table_path: &Path, table: &Table) -> Result<()> {
        let vc = table.version_chain_snapshot();
        let mut writer = BufWriter::new(File::create(table_path.join("version_chains.dat"))?);
        writer.write_all(&(vc.len() as i32).to_le_bytes())?;
        for (rid, versions) in vc.iter() {
            writer.write_all(&(*rid as i64).to_le_bytes())?;
            writer.write_all(&(versions.len() as i32).to_le_bytes())?;
            for entry in versions {
                for location in entry {
                    match location {
                        Some((page_idx, slot_idx)) => {
                            writer.write_all(&[1u8])?;
                            writer.write_all(&(*page_idx as i32).to_le_bytes())?;
                            writer.write_all(&(*slot_idx as i32).to_le_bytes())?;
                        }
                        None => writer.write_all(&[0u8])?,
                    }
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn create_table(&self, name: &str, num_columns: usize, key_col: usize) -> Arc<Table> {
        let table = Arc::new(Table::new(name, num_columns, key_col));
        self.tables.lock().unwrap().push(Arc::clone(&table));
        table
    }

    /// Removes `name` from the catalog. Returns `false` if no such table
    /// exists. Does not touch on-disk files, only the next `close` omits
    /// the dropped table.
    pub fn drop_table(&self, name: &str) -> bool {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.len();
        tables.retain(|t| t.name() != name);
        tables.len() != before
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_dir(tag: &str) -> PathBuf {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("small-db-test-{}-{}-{}", std::process::id(), tag, n))
    }

    #[test]
    fn open_on_fresh_path_creates_empty_directory() {
        let dir = scratch_dir("fresh");
        let db = Database::new();
        db.open(&dir).unwrap();
        assert!(dir.exists());
        assert!(db.get_table("anything").is_none());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn create_get_drop_table_round_trip() {
        let db = Database::new();
        db.create_table("grades", 3, 0);
        assert!(db.get_table("grades").is_some());
        assert!(db.drop_table("grades"));
        assert!(db.get_table("grades").is_none());
        assert!(!db.drop_table("grades"));
    }

    #[test]
    fn close_then_open_preserves_rows_and_history() {
        let dir = scratch_dir("roundtrip");

        {
            let db = Database::new();
            db.open(&dir).unwrap();
            let table = db.create_table("people", 2, 0);
            table.insert_row(&[1, 100]).unwrap();
            table.insert_row(&[2, 200]).unwrap();
            let query = crate::query::Query::new(&table);
            query.update(1, &[None, Some(999)]);
            db.close().unwrap();
        }

        {
            let db = Database::new();
            db.open(&dir).unwrap();
            let table = db.get_table("people").unwrap();
            let query = crate::query::Query::new(&table);

            let current = query.select(1, 0, &[true, true]);
            assert_eq!(current[0].columns[1], Some(999));

            let prior = query.select_version(1, 0, &[true, true], -1);
            assert_eq!(prior[0].columns[1], Some(100));

            let other = query.select(2, 0, &[true, true]);
            assert_eq!(other[0].columns[1], Some(200));

            assert!(query.insert(&[1, 0]) == false); // key 1 still taken after reload
        }

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reload_spans_multiple_pages() {
        let dir = scratch_dir("multipage");
        let total = crate::page::SLOTS_PER_PAGE * 2 + 3;

        {
            let db = Database::new();
            db.open(&dir).unwrap();
            let table = db.create_table("wide", 1, 0);
            for i in 0..total as i64 {
                table.insert_row(&[i]).unwrap();
            }
            db.close().unwrap();
        }

        {
            let db = Database::new();
            db.open(&dir).unwrap();
            let table = db.get_table("wide").unwrap();
            let query = crate::query::Query::new(&table);
            for i in 0..total as i64 {
                let rows = query.select(i, 0, &[true]);
                assert_eq!(rows[0].columns[0], Some(i));
            }
        }

        fs::remove_dir_all(&dir).ok();
    }
}
