//! Binary snapshot format. Self-describing: an 8-byte magic, a format
//! version, then the header fields and per-record data, all little-endian.
//! Load is the exact inverse of save and rejects truncated, oversized, or
//! mismatched files without building a partial graph.
//!
//! Layout:
//! ```text
//! magic[8] version:u32
//! dim:u32 m:u32 m0:u32 ef_construction:u32 metric:u8
//! capacity:u32 count:u32 delete_count:u32 entry_point:u32 max_layer:i32
//! then `count` records, in internal-id order:
//!   label:u32 deleted:u8 layer:u32 vector:[f32; dim]
//!   per layer 0..=layer: neighbor_count:u32 neighbor_ids:[u32]
//! ```

use crate::config::IndexConfig;
use crate::error::Error;
use crate::error::Result;
use crate::hnsw::HnswIndex;
use crate::metric::MetricKind;
use crate::NodeId;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use tracing::debug;

const MAGIC: [u8; 8] = *b"SMALLWLD";
const FORMAT_VERSION: u32 = 1;

fn truncated(e: std::io::Error) -> Error {
  if e.kind() == std::io::ErrorKind::UnexpectedEof {
    Error::Snapshot("unexpected end of file".to_string())
  } else {
    Error::Io(e)
  }
}

impl HnswIndex {
  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    self.save_to_writer(&mut w)?;
    w.flush()?;
    Ok(())
  }

  /// Writes a snapshot. Takes the mutation lock exclusively, so the bytes
  /// are a consistent point-in-time view.
  pub fn save_to_writer(&self, mut w: impl Write) -> Result<()> {
    self.ensure_loaded()?;
    let _guard = self.snapshot_guard();

    let cfg = self.config();
    let count = self.get_current_element_count();

    w.write_all(&MAGIC)?;
    w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    w.write_u32::<LittleEndian>(cfg.dim as u32)?;
    w.write_u32::<LittleEndian>(cfg.m as u32)?;
    w.write_u32::<LittleEndian>(cfg.max_m0() as u32)?;
    w.write_u32::<LittleEndian>(cfg.ef_construction as u32)?;
    w.write_u8(cfg.metric.code())?;
    w.write_u32::<LittleEndian>(cfg.capacity as u32)?;
    w.write_u32::<LittleEndian>(count as u32)?;
    w.write_u32::<LittleEndian>(self.get_delete_count() as u32)?;
    w.write_u32::<LittleEndian>(self.entry_point_raw())?;
    w.write_i32::<LittleEndian>(self.max_layer_raw())?;

    for id in 0..count as NodeId {
      let (label, deleted, layer, vector) = self.record(id)?;
      w.write_u32::<LittleEndian>(label)?;
      w.write_u8(deleted as u8)?;
      w.write_u32::<LittleEndian>(layer)?;
      w.write_all(bytemuck::cast_slice(vector.as_slice()))?;
      for l in 0..=layer as usize {
        let neighbors = self.node_neighbors(id, l)?;
        w.write_u32::<LittleEndian>(neighbors.len() as u32)?;
        for n in neighbors {
          w.write_u32::<LittleEndian>(n)?;
        }
      }
    }

    Ok(())
  }

  /// Reads a snapshot from `path`. The stored dimension and metric must match
  /// the requested ones.
  pub fn load(
    path: impl AsRef<Path>,
    dim: usize,
    metric: MetricKind,
  ) -> Result<HnswIndex> {
    let mut r = BufReader::new(File::open(path)?);
    Self::load_from_reader(&mut r, dim, metric)
  }

  pub fn load_from_reader(mut r: impl Read, dim: usize, metric: MetricKind) -> Result<HnswIndex> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(truncated)?;
    if magic != MAGIC {
      return Err(Error::Snapshot("bad magic".to_string()));
    }
    let version = r.read_u32::<LittleEndian>().map_err(truncated)?;
    if version != FORMAT_VERSION {
      return Err(Error::Snapshot(format!("unknown format version {version}")));
    }

    let file_dim = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let m = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let m0 = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let ef_construction = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let metric_code = r.read_u8().map_err(truncated)?;
    let capacity = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let count = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let delete_count = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let entry_point = r.read_u32::<LittleEndian>().map_err(truncated)?;
    let max_layer = r.read_i32::<LittleEndian>().map_err(truncated)?;

    if file_dim != dim {
      return Err(Error::Snapshot(format!(
        "dimension mismatch: file has {file_dim}, requested {dim}"
      )));
    }
    let file_metric = MetricKind::from_code(metric_code)
      .ok_or_else(|| Error::Snapshot(format!("unknown metric code {metric_code}")))?;
    if file_metric != metric {
      return Err(Error::Snapshot(format!(
        "metric mismatch: file has {file_metric}, requested {metric}"
      )));
    }
    if m == 0 || m0 != m * 2 {
      return Err(Error::Snapshot("invalid M/M0".to_string()));
    }
    if count > capacity {
      return Err(Error::Snapshot("count exceeds capacity".to_string()));
    }
    if count == 0 && entry_point != NodeId::MAX {
      return Err(Error::Snapshot("entry point in empty index".to_string()));
    }
    if count == 0 && max_layer != -1 {
      return Err(Error::Snapshot("max layer in empty index".to_string()));
    }
    if count > 0 && entry_point as usize >= count {
      return Err(Error::Snapshot("entry point out of range".to_string()));
    }

    let cfg = IndexConfig {
      dim,
      m,
      ef_construction,
      random_seed: 100,
      metric,
      capacity,
    };
    let idx = HnswIndex::new(cfg)?;

    let mut vector_buf = vec![0u8; dim * 4];
    let mut entry_layer = -1i64;
    for id in 0..count as NodeId {
      let label = r.read_u32::<LittleEndian>().map_err(truncated)?;
      let deleted = match r.read_u8().map_err(truncated)? {
        0 => false,
        1 => true,
        other => {
          return Err(Error::Snapshot(format!("invalid deleted flag {other}")));
        }
      };
      let layer = r.read_u32::<LittleEndian>().map_err(truncated)?;
      if i64::from(layer) > i64::from(max_layer) {
        return Err(Error::Snapshot(format!(
          "record layer {layer} exceeds max layer {max_layer} at slot {id}"
        )));
      }
      if id == entry_point {
        entry_layer = i64::from(layer);
      }

      r.read_exact(&mut vector_buf).map_err(truncated)?;
      let mut vector = Vec::with_capacity(dim);
      for chunk in vector_buf.chunks_exact(4) {
        vector.push(f32::from_le_bytes(chunk.try_into().unwrap()));
      }

      let mut layers = Vec::with_capacity(layer as usize + 1);
      for l in 0..=layer as usize {
        let cap = if l == 0 { m0 } else { m };
        let n = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if n > cap {
          return Err(Error::Snapshot(format!(
            "neighbor list exceeds cap at slot {id} layer {l}"
          )));
        }
        let mut list = Vec::with_capacity(n);
        for _ in 0..n {
          let to = r.read_u32::<LittleEndian>().map_err(truncated)?;
          if to as usize >= count {
            return Err(Error::Snapshot(format!(
              "neighbor id {to} out of range at slot {id}"
            )));
          }
          list.push(to);
        }
        layers.push(list);
      }

      idx.restore_record(id, label, deleted, layer, vector, layers)?;
    }

    if count > 0 && entry_layer != i64::from(max_layer) {
      return Err(Error::Snapshot(format!(
        "entry point layer {entry_layer} does not match max layer {max_layer}"
      )));
    }

    if idx.get_delete_count() != delete_count {
      return Err(Error::Snapshot(format!(
        "delete count mismatch: header says {delete_count}, records say {}",
        idx.get_delete_count()
      )));
    }

    let mut trailing = [0u8; 1];
    match r.read(&mut trailing)? {
      0 => {}
      _ => return Err(Error::Snapshot("trailing bytes after records".to_string())),
    }

    idx.restore_graph_state(count, entry_point, max_layer);
    debug!(count, max_layer, "loaded index snapshot");
    Ok(idx)
  }
}
