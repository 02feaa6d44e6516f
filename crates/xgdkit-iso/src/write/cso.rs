//! CSO output: per-sector LZ4 frame compression fed through a worker pool.
//!
//! Compression is the hot loop of a CSO conversion, so sectors are handed to
//! a bounded pool in batches. Jobs and results are owned values over
//! channels; each worker compresses independently, and results are put back
//! into sector order before anything touches the output file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::avl::iter::write_events;
use crate::avl::AvlTree;
use crate::cancel::CancelToken;
use crate::formats::cso;
use crate::layout::{build_volume_header, num_sectors, PAD_BYTE, SECTOR_SIZE};
use crate::read::ImageReader;
use crate::write::{directory_to_buffer, part_paths, resolve_out_paths, DataSource};
use crate::{create_dir_all, Error, Platform, Result, ScrubType};

const ALIGNMENT: u64 = 1 << cso::INDEX_ALIGNMENT;
const MAX_WORKERS: usize = 32;

/// A frame whose block section would not fit under the sector size (block
/// length word plus worst-case overhead) is stored raw instead.
const FRAME_OVERHEAD: usize = 12;

struct Job {
    sector_idx: u32,
    data: Vec<u8>,
}

struct JobResult {
    sector_idx: u32,
    compressed: bool,
    /// The on-disc record: a frame block section, or the raw sector.
    payload: Vec<u8>,
}

/// A fixed pool of compressor threads. Dropping the pool closes the job
/// channel and the workers drain and exit.
struct CompressPool {
    job_tx: Option<mpsc::Sender<Job>>,
    result_rx: mpsc::Receiver<JobResult>,
    workers: Vec<std::thread::JoinHandle<()>>,
    size: usize,
}

impl CompressPool {
    fn start() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<JobResult>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..size)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                std::thread::spawn(move || loop {
                    let job = match job_rx.lock().expect("pool lock").recv() {
                        Ok(job) => job,
                        Err(_) => return,
                    };
                    let result = compress_sector(job);
                    if result_tx.send(result).is_err() {
                        return;
                    }
                })
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            result_rx,
            workers,
            size,
        }
    }

    /// Compresses a batch of whole sectors, returning results in sector
    /// order.
    fn compress_batch(&self, sectors: &[u8]) -> Result<Vec<JobResult>> {
        debug_assert_eq!(sectors.len() as u64 % SECTOR_SIZE, 0);
        let count = sectors.len() / SECTOR_SIZE as usize;
        let job_tx = self.job_tx.as_ref().expect("pool running");
        for (idx, sector) in sectors.chunks_exact(SECTOR_SIZE as usize).enumerate() {
            job_tx
                .send(Job {
                    sector_idx: idx as u32,
                    data: sector.to_vec(),
                })
                .map_err(|_| Error::Other("compression pool shut down".into()))?;
        }
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(
                self.result_rx
                    .recv()
                    .map_err(|_| Error::Other("compression pool shut down".into()))?,
            );
        }
        results.sort_by_key(|result| result.sector_idx);
        Ok(results)
    }
}

impl Drop for CompressPool {
    fn drop(&mut self) {
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn compress_sector(job: Job) -> JobResult {
    let compressed = lz4_flex::block::compress(&job.data);
    if compressed.len() + FRAME_OVERHEAD >= SECTOR_SIZE as usize {
        return JobResult {
            sector_idx: job.sector_idx,
            compressed: false,
            payload: job.data,
        };
    }
    let mut payload = Vec::with_capacity(4 + compressed.len());
    payload.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    payload.extend_from_slice(&compressed);
    JobResult {
        sector_idx: job.sector_idx,
        compressed: true,
        payload,
    }
}

pub struct CsoWriter<'r> {
    reader: Option<&'r mut ImageReader>,
    source_dir: Option<PathBuf>,
    scrub: ScrubType,
    pool: CompressPool,
}

impl<'r> CsoWriter<'r> {
    pub fn from_reader(reader: &'r mut ImageReader, scrub: ScrubType) -> Self {
        Self {
            reader: Some(reader),
            source_dir: None,
            scrub,
            pool: CompressPool::start(),
        }
    }

    pub fn from_dir(source_dir: &Path) -> Self {
        Self {
            reader: None,
            source_dir: Some(source_dir.to_path_buf()),
            scrub: ScrubType::Full,
            pool: CompressPool::start(),
        }
    }

    pub fn convert(mut self, out_path: &Path, token: &CancelToken) -> Result<Vec<PathBuf>> {
        if let Some(parent) = out_path.parent() {
            create_dir_all(parent)?;
        }
        let (part_1, part_2) = part_paths(out_path);

        if let Some(dir) = self.source_dir.take() {
            let tree = AvlTree::from_dir(
                &dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                &dir,
            )?;
            self.from_avl(tree, DataSource::Filesystem, &part_1, &part_2, token)?;
        } else {
            let reader = self
                .reader
                .take()
                .ok_or_else(|| Error::Other("cso writer needs a reader or a directory".into()))?;
            if self.scrub == ScrubType::Full {
                let name = reader.name().to_string();
                let tree = AvlTree::from_entries(&name, reader.directory_entries()?)?;
                self.from_avl(tree, DataSource::Reader(reader), &part_1, &part_2, token)?;
            } else {
                self.pass_through(reader, &part_1, &part_2, token)?;
            }
        }

        resolve_out_paths(out_path.to_path_buf(), part_1, part_2)
    }

    fn pass_through(
        &self,
        reader: &mut ImageReader,
        part_1: &Path,
        part_2: &Path,
        token: &CancelToken,
    ) -> Result<()> {
        let scrub = self.scrub == ScrubType::Partial;
        let sector_offset = (reader.image_offset() / SECTOR_SIZE) as u32;
        let mut end_sector = reader.total_sectors();
        if scrub {
            end_sector = end_sector.min(reader.max_data_sector()? + 1);
        }
        let zero_padding = scrub && reader.platform()? == Platform::Ogx;
        let sectors_to_write = (end_sector - sector_offset) as u64;

        let mut output = CsoOutput::create(part_1, part_2, sectors_to_write)?;
        tracing::info!(sectors = sectors_to_write, "writing CSO");

        let batch = self.pool.size;
        let mut buffer = vec![0u8; batch * SECTOR_SIZE as usize];
        let mut sector = sector_offset;
        while sector < end_sector {
            token.checkpoint()?;
            let count = ((end_sector - sector) as usize).min(batch);
            for i in 0..count {
                let chunk =
                    &mut buffer[i * SECTOR_SIZE as usize..(i + 1) * SECTOR_SIZE as usize];
                let keep = !zero_padding || reader.data_sectors()?.contains(&(sector + i as u32));
                if keep {
                    reader.read_sector(sector + i as u32, chunk)?;
                } else {
                    chunk.fill(0);
                }
            }
            for result in self
                .pool
                .compress_batch(&buffer[..count * SECTOR_SIZE as usize])?
            {
                output.write_record(&result)?;
            }
            sector += count as u32;
        }
        output.finalize()
    }

    fn from_avl(
        &self,
        tree: AvlTree,
        mut source: DataSource,
        part_1: &Path,
        part_2: &Path,
        token: &CancelToken,
    ) -> Result<()> {
        let events = write_events(&tree);
        let total_sectors = num_sectors(tree.iso_size());
        let mut output = CsoOutput::create(part_1, part_2, total_sectors)?;

        tracing::info!(
            files = tree.total_files(),
            bytes = tree.total_bytes(),
            "writing CSO"
        );

        let root = tree.node(tree.root());
        let header = build_volume_header(
            root.start_sector as u32,
            root.file_size as u32,
            total_sectors as u32,
            source.file_time()?,
        );
        self.write_batch(&mut output, &header)?;

        // Zeros up to the first event; pad bytes only between events.
        if let Some(first) = events.first() {
            let gap = first.offset / SECTOR_SIZE - output.sectors_written;
            self.write_pad_sectors(&mut output, gap, 0x00)?;
        }

        let mut index = 0;
        while index < events.len() {
            token.checkpoint()?;
            let event = events[index];
            let event_sector = event.offset / SECTOR_SIZE;

            if output.sectors_written < event_sector {
                let gap = event_sector - output.sectors_written;
                self.write_pad_sectors(&mut output, gap, PAD_BYTE)?;
            }
            if output.sectors_written != event_sector || event.offset % SECTOR_SIZE != 0 {
                return Err(Error::Other("CSO output has become misaligned".into()));
            }

            if event.directory_entry {
                let (buffer, processed) = directory_to_buffer(&tree, &events, index);
                index += processed;
                self.write_batch(&mut output, &buffer)?;
            } else {
                source.copy_file_sectors(
                    &tree,
                    event.node,
                    self.pool.size as u64,
                    |chunk| {
                        token.checkpoint()?;
                        self.write_batch(&mut output, chunk)
                    },
                )?;
                index += 1;
            }
        }

        if output.sectors_written < total_sectors {
            let tail = total_sectors - output.sectors_written;
            self.write_pad_sectors(&mut output, tail, 0x00)?;
        }
        output.finalize()
    }

    fn write_batch(&self, output: &mut CsoOutput, sectors: &[u8]) -> Result<()> {
        for batch in sectors.chunks(self.pool.size * SECTOR_SIZE as usize) {
            for result in self.pool.compress_batch(batch)? {
                output.write_record(&result)?;
            }
        }
        Ok(())
    }

    fn write_pad_sectors(&self, output: &mut CsoOutput, count: u64, pad_byte: u8) -> Result<()> {
        let batch = vec![pad_byte; self.pool.size * SECTOR_SIZE as usize];
        let mut remaining = count;
        while remaining > 0 {
            let now = remaining.min(self.pool.size as u64);
            self.write_batch(output, &batch[..(now * SECTOR_SIZE) as usize])?;
            remaining -= now;
        }
        Ok(())
    }
}

/// The physical CSO stream: header and reserved index in part 1, records
/// appended with 4-byte alignment, second part past the split offset. Index
/// entries hold logical offsets, so part 2 records resolve through the part
/// 1 size.
struct CsoOutput {
    parts: Vec<File>,
    /// Logical position across all parts.
    logical: u64,
    part_2_path: PathBuf,
    index: Vec<u32>,
    sectors_written: u64,
    total_sectors: u64,
}

impl CsoOutput {
    fn create(part_1: &Path, part_2: &Path, total_sectors: u64) -> Result<Self> {
        let mut file = open_part(part_1)?;
        let header = cso::Header::new(total_sectors * SECTOR_SIZE);
        file.write_all(bytemuck::bytes_of(&header))?;
        // Reserve the inline index; patched in finalize.
        file.write_all(&vec![0u8; (total_sectors as usize + 1) * 4])?;
        let logical = cso::HEADER_SIZE as u64 + (total_sectors + 1) * 4;
        Ok(Self {
            parts: vec![file],
            logical,
            part_2_path: part_2.to_path_buf(),
            index: Vec::with_capacity(total_sectors as usize + 1),
            sectors_written: 0,
            total_sectors,
        })
    }

    fn write_record(&mut self, result: &JobResult) -> Result<()> {
        if self.logical > cso::SPLIT_OFFSET && self.parts.len() == 1 {
            self.parts.push(open_part(&self.part_2_path)?);
        }

        // Records start on the index alignment.
        if self.logical % ALIGNMENT != 0 {
            let padding = ALIGNMENT - self.logical % ALIGNMENT;
            self.write_bytes(&vec![0u8; padding as usize])?;
        }

        let mut word = (self.logical >> cso::INDEX_ALIGNMENT) as u32;
        if result.compressed {
            word |= cso::INDEX_COMPRESSED;
        }
        self.index.push(word);
        self.write_bytes(&result.payload)?;
        self.sectors_written += 1;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.parts.last_mut().expect("part open").write_all(bytes)?;
        self.logical += bytes.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        debug_assert_eq!(self.sectors_written, self.total_sectors);
        self.index.push((self.logical >> cso::INDEX_ALIGNMENT) as u32);

        // Pad the final part out to the file modulus.
        if self.logical % cso::FILE_MODULUS != 0 {
            let padding = cso::FILE_MODULUS - self.logical % cso::FILE_MODULUS;
            self.write_bytes(&vec![0u8; padding as usize])?;
        }

        let part_1 = &mut self.parts[0];
        part_1.seek(SeekFrom::Start(cso::HEADER_SIZE as u64))?;
        for word in &self.index {
            part_1.write_all(&word.to_le_bytes())?;
        }
        for part in &mut self.parts {
            part.flush()?;
        }
        Ok(())
    }
}

fn open_part(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_preserves_sector_order() {
        let pool = CompressPool::start();
        let mut sectors = Vec::new();
        for i in 0..8u8 {
            sectors.extend(std::iter::repeat_n(i, SECTOR_SIZE as usize));
        }
        let results = pool.compress_batch(&sectors).unwrap();
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.sector_idx, i as u32);
            assert!(result.compressed);
            let word = u32::from_le_bytes(result.payload[0..4].try_into().unwrap());
            let mut out = vec![0u8; SECTOR_SIZE as usize];
            let size =
                lz4_flex::block::decompress_into(&result.payload[4..4 + word as usize], &mut out)
                    .unwrap();
            assert_eq!(size as u64, SECTOR_SIZE);
            assert!(out.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn incompressible_sector_is_stored_raw() {
        // A pseudo-random sector will not compress under the threshold.
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..SECTOR_SIZE)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        let result = compress_sector(Job {
            sector_idx: 0,
            data: data.clone(),
        });
        assert!(!result.compressed);
        assert_eq!(result.payload, data);
    }
}
