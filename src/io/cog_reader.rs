//! Async COG reading using async-tiff.
//!
//! Reads only the portion of a COG that overlaps the requested pixel window.
//! Algorithm:
//! 1. Read TIFF header/metadata (cached for remote sources)
//! 2. Identify which internal tiles cover the requested window
//! 3. Fetch those tiles in parallel (range requests)
//! 4. Decode off the async runtime and assemble into a typed array
//! 5. Clip to the exact requested window

use crate::config::NetworkConfig;
use crate::crs;
use crate::io::store::RasterSource;
use crate::pipeline::Metrics;
use crate::window::{GeoTransform, PixelWindow};
use anyhow::{Context, Result};
use async_tiff::decoder::DecoderRegistry;
use async_tiff::metadata::cache::ReadaheadMetadataCache;
use async_tiff::metadata::TiffMetadataReader;
use async_tiff::reader::{AsyncFileReader, ObjectReader};
use async_tiff::tags::PlanarConfiguration;
use async_tiff::{TypedArray, TIFF};
use dashmap::DashMap;
use futures::future::try_join_all;
use lru::LruCache;
use ndarray::{Array2, Array3, Axis};
use quick_xml::events::Event;
use quick_xml::Reader;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

/// GeoKey value meaning "user-defined", i.e. no EPSG code.
const USER_DEFINED_GEOKEY: u16 = 32767;

/// Raster-level metadata read at open time.
#[derive(Debug, Clone)]
pub struct CogMetadata {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub is_planar: bool,
    pub geo_transform: Option<GeoTransform>,
    /// `EPSG:<code>` from the GeoKey directory
    pub crs: Option<String>,
    /// GDAL_NODATA tag
    pub nodata: Option<f64>,
    /// Dataset-level GDAL_METADATA items
    pub tags: Vec<(String, String)>,
}

/// An opened COG: parsed IFDs plus the reader used to fetch its tiles.
pub struct CogHandle {
    source_id: String,
    tiff: Arc<TIFF>,
    reader: Arc<dyn AsyncFileReader>,
    metadata: CogMetadata,
}

impl CogHandle {
    pub fn metadata(&self) -> &CogMetadata {
        &self.metadata
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl std::fmt::Debug for CogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CogHandle")
            .field("source_id", &self.source_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Pixel data read from a window, typed by the source sample format.
///
/// Arrays are `(bands, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterData {
    UInt8(Array3<u8>),
    Int8(Array3<i8>),
    UInt16(Array3<u16>),
    Int16(Array3<i16>),
    UInt32(Array3<u32>),
    Int32(Array3<i32>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

/// Apply the same expression to whichever typed array a `RasterData` holds.
macro_rules! with_raster_data {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            $crate::io::RasterData::UInt8($arr) => $body,
            $crate::io::RasterData::Int8($arr) => $body,
            $crate::io::RasterData::UInt16($arr) => $body,
            $crate::io::RasterData::Int16($arr) => $body,
            $crate::io::RasterData::UInt32($arr) => $body,
            $crate::io::RasterData::Int32($arr) => $body,
            $crate::io::RasterData::Float32($arr) => $body,
            $crate::io::RasterData::Float64($arr) => $body,
        }
    };
}

impl RasterData {
    /// `(bands, height, width)`
    pub fn dim(&self) -> (usize, usize, usize) {
        with_raster_data!(self, arr => arr.dim())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UInt8(_) => "uint8",
            Self::Int8(_) => "int8",
            Self::UInt16(_) => "uint16",
            Self::Int16(_) => "int16",
            Self::UInt32(_) => "uint32",
            Self::Int32(_) => "int32",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
        }
    }

    /// One band widened to f64.
    pub fn band_f64(&self, band: usize) -> Option<Array2<f64>> {
        with_raster_data!(self, arr => {
            if band >= arr.len_of(Axis(0)) {
                return None;
            }
            Some(arr.index_axis(Axis(0), band).mapv(|v| v as f64))
        })
    }
}

/// LRU cache for remote TIFF metadata with single-flight deduplication.
pub struct TiffMetadataCache {
    cache: RwLock<LruCache<String, Arc<CogHandle>>>,
    in_flight: DashMap<String, broadcast::Sender<Result<Arc<CogHandle>, String>>>,
    metrics: Option<Arc<Metrics>>,
}

impl TiffMetadataCache {
    pub fn new(max_entries: usize, metrics: Option<Arc<Metrics>>) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            metrics,
        }
    }

    /// Get cached metadata or load it, with single-flight deduplication.
    ///
    /// Concurrent requests for the same key wait on the first request's result.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Result<Arc<CogHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CogHandle>>,
    {
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(key) {
                if let Some(ref m) = self.metrics {
                    m.add_metadata_cache_hit();
                }
                return Ok(cached.clone());
            }
        }

        if let Some(sender_ref) = self.in_flight.get(key) {
            let mut rx = sender_ref.subscribe();
            drop(sender_ref);

            if let Some(ref m) = self.metrics {
                m.add_metadata_cache_hit();
            }

            return match rx.recv().await {
                Ok(Ok(cached)) => Ok(cached),
                Ok(Err(e)) => Err(anyhow::anyhow!("Coalesced fetch failed: {}", e)),
                Err(e) => Err(anyhow::anyhow!("Broadcast channel error: {}", e)),
            };
        }

        let (tx, _) = broadcast::channel(16);
        self.in_flight.insert(key.to_string(), tx.clone());

        if let Some(ref m) = self.metrics {
            m.add_metadata_cache_miss();
        }

        match load().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                {
                    let mut cache = self.cache.write().await;
                    cache.put(key.to_string(), handle.clone());
                }
                self.in_flight.remove(key);
                let _ = tx.send(Ok(handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                self.in_flight.remove(key);
                let _ = tx.send(Err(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// Async COG reader for windowed reads over HTTP, S3, or local files.
pub struct CogReader {
    network: NetworkConfig,
    decoder_registry: Arc<DecoderRegistry>,
    metadata_cache: Arc<TiffMetadataCache>,
    metrics: Option<Arc<Metrics>>,
}

impl CogReader {
    pub fn new(network: NetworkConfig, metadata_cache_entries: usize) -> Self {
        Self {
            network,
            decoder_registry: Arc::new(DecoderRegistry::default()),
            metadata_cache: Arc::new(TiffMetadataCache::new(metadata_cache_entries, None)),
            metrics: None,
        }
    }

    /// Create a reader that reports cache and read statistics.
    pub fn with_metrics(network: NetworkConfig, metadata_cache_entries: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            network,
            decoder_registry: Arc::new(DecoderRegistry::default()),
            metadata_cache: Arc::new(TiffMetadataCache::new(metadata_cache_entries, Some(metrics.clone()))),
            metrics: Some(metrics),
        }
    }

    /// Open a source and read its metadata.
    ///
    /// Remote headers are cached; local files are re-read every time since
    /// they may be rewritten between calls.
    pub async fn open(&self, source: &RasterSource) -> Result<Arc<CogHandle>> {
        if source.is_remote() {
            let key = source.to_string();
            self.metadata_cache
                .get_or_load(&key, || self.load(source))
                .await
        } else {
            Ok(Arc::new(self.load(source).await?))
        }
    }

    async fn load(&self, source: &RasterSource) -> Result<CogHandle> {
        let (store, path) = source.open_store(&self.network)?;
        let reader: Arc<dyn AsyncFileReader> = Arc::new(ObjectReader::new(store, path));

        let read_cache = ReadaheadMetadataCache::new(reader.clone());
        let mut metadata_reader = TiffMetadataReader::try_open(&read_cache)
            .await
            .context("Failed to open TIFF metadata")?;
        let ifds = metadata_reader
            .read_all_ifds(&read_cache)
            .await
            .context("Failed to read IFDs")?;
        let tiff = TIFF::new(ifds, metadata_reader.endianness());

        let ifd = tiff.ifds().first().context("No IFDs in TIFF")?;

        let width = ifd.image_width() as usize;
        let height = ifd.image_height() as usize;
        let bands = ifd.samples_per_pixel() as usize;
        let is_planar = matches!(ifd.planar_configuration(), PlanarConfiguration::Planar);
        let tile_width = ifd.tile_width().map_or(width, |w| w as usize);
        let tile_height = ifd.tile_height().map_or(height, |h| h as usize);
        if width == 0 || height == 0 || bands == 0 {
            anyhow::bail!("Raster has no pixels: {}x{} with {} bands", width, height, bands);
        }

        let geo_transform = ifd
            .model_transformation()
            .and_then(GeoTransform::from_model_transformation)
            .or_else(|| match (ifd.model_pixel_scale(), ifd.model_tiepoint()) {
                (Some(scale), Some(tiepoint)) => GeoTransform::from_pixel_scale_tiepoint(scale, tiepoint),
                _ => None,
            });

        let crs = ifd.geo_key_directory().and_then(|keys| {
            keys.projected_type
                .filter(|code| *code != USER_DEFINED_GEOKEY)
                .or(keys.geographic_type.filter(|code| *code != USER_DEFINED_GEOKEY))
                .map(crs::epsg)
        });

        let nodata = ifd.gdal_nodata().and_then(parse_nodata);
        let tags = match ifd.gdal_metadata() {
            Some(xml) => parse_gdal_metadata(xml).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable GDAL_METADATA in {}: {:#}", source, e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        tracing::debug!(
            "Opened {}: {}x{}, {} bands, tile {}x{}, crs={:?}, nodata={:?}",
            source, width, height, bands, tile_width, tile_height, crs, nodata
        );

        Ok(CogHandle {
            source_id: source.to_string(),
            tiff: Arc::new(tiff),
            reader,
            metadata: CogMetadata {
                width,
                height,
                bands,
                tile_width,
                tile_height,
                is_planar,
                geo_transform,
                crs,
                nodata,
                tags,
            },
        })
    }

    /// Read a window from an opened COG.
    ///
    /// Only the internal tiles overlapping the window are fetched.
    pub async fn read_window(&self, cog: &CogHandle, window: PixelWindow) -> Result<RasterData> {
        let meta = &cog.metadata;

        if window.is_empty() {
            anyhow::bail!("Cannot read an empty window from {}", cog.source_id);
        }
        if window.col_off + window.width > meta.width || window.row_off + window.height > meta.height {
            anyhow::bail!(
                "Window ({}) exceeds image bounds ({}x{}) of {}",
                window, meta.width, meta.height, cog.source_id
            );
        }

        let start = Instant::now();
        let (tw, th) = (meta.tile_width, meta.tile_height);
        let start_tx = window.col_off / tw;
        let end_tx = (window.col_off + window.width - 1) / tw;
        let start_ty = window.row_off / th;
        let end_ty = (window.row_off + window.height - 1) / th;

        tracing::debug!(
            "Fetching tiles x=[{}..{}] y=[{}..{}] for window {} of {}",
            start_tx, end_tx, start_ty, end_ty, window, cog.source_id
        );

        let mut tile_futures = Vec::new();
        for ty in start_ty..=end_ty {
            for tx in start_tx..=end_tx {
                tile_futures.push(self.fetch_tile(cog, tx, ty));
            }
        }
        let tiles = try_join_all(tile_futures).await?;

        if let Some(ref m) = self.metrics {
            m.add_tiles_read(tiles.len() as u64);
        }

        let assembled_x = start_tx * tw;
        let assembled_y = start_ty * th;
        let assembled_w = ((end_tx - start_tx + 1) * tw).min(meta.width - assembled_x);
        let assembled_h = ((end_ty - start_ty + 1) * th).min(meta.height - assembled_y);

        let layout = AssemblyLayout {
            bands: meta.bands,
            height: assembled_h,
            width: assembled_w,
            tile_width: tw,
            tile_height: th,
            start_tx,
            start_ty,
            is_planar: meta.is_planar,
        };
        let assembled = assemble(&tiles, &layout)?;

        let clip_x = window.col_off - assembled_x;
        let clip_y = window.row_off - assembled_y;
        let slice = ndarray::s![.., clip_y..clip_y + window.height, clip_x..clip_x + window.width];
        let clipped = match assembled {
            RasterData::UInt8(a) => RasterData::UInt8(a.slice(slice).to_owned()),
            RasterData::Int8(a) => RasterData::Int8(a.slice(slice).to_owned()),
            RasterData::UInt16(a) => RasterData::UInt16(a.slice(slice).to_owned()),
            RasterData::Int16(a) => RasterData::Int16(a.slice(slice).to_owned()),
            RasterData::UInt32(a) => RasterData::UInt32(a.slice(slice).to_owned()),
            RasterData::Int32(a) => RasterData::Int32(a.slice(slice).to_owned()),
            RasterData::Float32(a) => RasterData::Float32(a.slice(slice).to_owned()),
            RasterData::Float64(a) => RasterData::Float64(a.slice(slice).to_owned()),
        };

        if let Some(ref m) = self.metrics {
            m.add_read_time(start.elapsed());
        }

        Ok(clipped)
    }

    /// Fetch and decode a single internal tile.
    async fn fetch_tile(&self, cog: &CogHandle, tx: usize, ty: usize) -> Result<DecodedTile> {
        let ifd = cog.tiff.ifds().first().context("No IFDs in TIFF")?;

        let fetch_start = Instant::now();
        let tile = ifd
            .fetch_tile(tx, ty, cog.reader.as_ref())
            .await
            .with_context(|| format!("Failed to fetch tile ({}, {}) of {}", tx, ty, cog.source_id))?;

        let raw_bytes: u64 = tile.compressed_bytes().len() as u64;
        tracing::trace!(
            "Fetched tile ({},{}) {}KB in {:.1}ms",
            tx, ty, raw_bytes / 1024, fetch_start.elapsed().as_secs_f64() * 1000.0
        );
        if let Some(ref m) = self.metrics {
            m.add_bytes_read(raw_bytes);
        }

        let decoder_registry = self.decoder_registry.clone();
        let array = tokio::task::spawn_blocking(move || tile.decode(&decoder_registry))
            .await
            .map_err(|e| anyhow::anyhow!("Decode task panicked: {}", e))?
            .map_err(|e| anyhow::anyhow!("Failed to decode tile ({}, {}): {:?}", tx, ty, e))?;

        Ok(DecodedTile { tx, ty, array })
    }
}

struct DecodedTile {
    tx: usize,
    ty: usize,
    array: async_tiff::Array,
}

struct AssemblyLayout {
    bands: usize,
    height: usize,
    width: usize,
    tile_width: usize,
    tile_height: usize,
    start_tx: usize,
    start_ty: usize,
    is_planar: bool,
}

/// Assemble decoded tiles into one typed array. All tiles must share a sample type.
fn assemble(tiles: &[DecodedTile], layout: &AssemblyLayout) -> Result<RasterData> {
    let first = tiles.first().context("No tiles to assemble")?;

    macro_rules! assemble_as {
        ($variant:ident) => {{
            let mut out = Array3::default((layout.bands, layout.height, layout.width));
            for tile in tiles {
                let data = match tile.array.data() {
                    TypedArray::$variant(data) => data,
                    _ => anyhow::bail!("Tiles have mixed sample types"),
                };
                let out_x = (tile.tx - layout.start_tx) * layout.tile_width;
                let out_y = (tile.ty - layout.start_ty) * layout.tile_height;
                let copy_width = layout.tile_width.min(layout.width - out_x);
                let copy_height = layout.tile_height.min(layout.height - out_y);
                copy_typed_data(
                    data,
                    &mut out,
                    out_x,
                    out_y,
                    copy_width,
                    copy_height,
                    layout.is_planar,
                    tile.array.shape(),
                );
            }
            RasterData::$variant(out)
        }};
    }

    let data = match first.array.data() {
        TypedArray::UInt8(_) => assemble_as!(UInt8),
        TypedArray::Int8(_) => assemble_as!(Int8),
        TypedArray::UInt16(_) => assemble_as!(UInt16),
        TypedArray::Int16(_) => assemble_as!(Int16),
        TypedArray::UInt32(_) => assemble_as!(UInt32),
        TypedArray::Int32(_) => assemble_as!(Int32),
        TypedArray::Float32(_) => assemble_as!(Float32),
        TypedArray::Float64(_) => assemble_as!(Float64),
        _ => anyhow::bail!("Unsupported sample type"),
    };
    Ok(data)
}

/// Copy one decoded tile into the assembled `(bands, height, width)` array.
///
/// `shape` is the decoded tile shape: `[bands, h, w]` when planar,
/// `[h, w, bands]` when chunky. Bands are copied in parallel.
#[allow(clippy::too_many_arguments)]
fn copy_typed_data<T: Copy + Send + Sync>(
    data: &[T],
    output: &mut Array3<T>,
    out_x: usize,
    out_y: usize,
    copy_width: usize,
    copy_height: usize,
    is_planar: bool,
    shape: [usize; 3],
) {
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut plane)| {
            for row in 0..copy_height {
                for col in 0..copy_width {
                    let src_idx = if is_planar {
                        b * shape[1] * shape[2] + row * shape[2] + col
                    } else {
                        row * shape[1] * shape[2] + col * shape[2] + b
                    };
                    if let Some(v) = data.get(src_idx) {
                        plane[[out_y + row, out_x + col]] = *v;
                    }
                }
            }
        });
}

/// Parse a GDAL_NODATA tag value (`"-9999"`, `"nan"`, `"0 "`).
pub fn parse_nodata(value: &str) -> Option<f64> {
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    match value.to_ascii_lowercase().as_str() {
        "nan" | "-nan" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

/// Extract dataset-level items from a GDAL_METADATA XML tag.
///
/// Items carrying a `sample` attribute belong to a single band and are skipped,
/// as are items with a `role` (descriptions, offsets, scales).
pub fn parse_gdal_metadata(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut items = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"Item" => {
                let mut name = None;
                let mut band_level = false;
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.as_ref() {
                        b"name" => name = Some(attr.unescape_value()?.into_owned()),
                        b"sample" | b"role" => band_level = true,
                        _ => {}
                    }
                }
                current = if band_level { None } else { name };
                text.clear();
            }
            Ok(Event::Text(t)) if current.is_some() => {
                text.push_str(&t.unescape()?);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"Item" => {
                if let Some(name) = current.take() {
                    items.push((name, std::mem::take(&mut text)));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("XML error at position {}: {:?}", reader.buffer_position(), e),
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_planar_data() {
        // Planar data: [bands=2, height=2, width=3]
        let data: Vec<u16> = vec![
            1, 2, 3, 4, 5, 6,
            7, 8, 9, 10, 11, 12,
        ];
        let mut output = Array3::<u16>::zeros((2, 2, 3));

        copy_typed_data(&data, &mut output, 0, 0, 3, 2, true, [2, 2, 3]);

        assert_eq!(output[[0, 0, 0]], 1);
        assert_eq!(output[[0, 0, 2]], 3);
        assert_eq!(output[[0, 1, 0]], 4);
        assert_eq!(output[[1, 0, 0]], 7);
        assert_eq!(output[[1, 1, 2]], 12);
    }

    #[test]
    fn test_copy_chunky_data() {
        // Chunky data: [height=2, width=3, bands=2]
        let data: Vec<f32> = vec![
            1.0, 7.0, 2.0, 8.0, 3.0, 9.0,
            4.0, 10.0, 5.0, 11.0, 6.0, 12.0,
        ];
        let mut output = Array3::<f32>::zeros((2, 2, 3));

        copy_typed_data(&data, &mut output, 0, 0, 3, 2, false, [2, 3, 2]);

        assert_eq!(output[[0, 0, 0]], 1.0);
        assert_eq!(output[[0, 0, 2]], 3.0);
        assert_eq!(output[[1, 0, 0]], 7.0);
        assert_eq!(output[[1, 1, 2]], 12.0);
    }

    #[test]
    fn test_copy_edge_tile_with_offset() {
        // A padded 2x2 tile of which only 1x2 lands inside the assembled area
        let data: Vec<u8> = vec![1, 2, 3, 4];
        let mut output = Array3::<u8>::zeros((1, 3, 3));

        copy_typed_data(&data, &mut output, 2, 1, 1, 2, true, [1, 2, 2]);

        assert_eq!(output[[0, 1, 2]], 1);
        assert_eq!(output[[0, 2, 2]], 3);
        assert_eq!(output.iter().filter(|v| **v != 0).count(), 2);
    }

    #[test]
    fn test_raster_data_helpers() {
        let data = RasterData::Int16(Array3::from_shape_fn((2, 3, 4), |(b, r, c)| (b * 100 + r * 10 + c) as i16));
        assert_eq!(data.dim(), (2, 3, 4));
        assert_eq!(data.type_name(), "int16");

        let band = data.band_f64(1).unwrap();
        assert_eq!(band.dim(), (3, 4));
        assert_eq!(band[[2, 3]], 123.0);
        assert!(data.band_f64(2).is_none());
    }

    #[test]
    fn test_parse_nodata() {
        assert_eq!(parse_nodata("-9999"), Some(-9999.0));
        assert_eq!(parse_nodata("0\0"), Some(0.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata("none"), None);
    }

    #[test]
    fn test_parse_gdal_metadata() {
        let xml = r#"<GDALMetadata>
  <Item name="CLOUD_COVER">12.5</Item>
  <Item name="PRODUCT">S2 &amp; L2A</Item>
  <Item name="DESCRIPTION" sample="0" role="description">B04</Item>
  <Item name="STATISTICS_MAXIMUM" sample="0">4095</Item>
</GDALMetadata>"#;
        let items = parse_gdal_metadata(xml).unwrap();
        assert_eq!(
            items,
            vec![
                ("CLOUD_COVER".to_string(), "12.5".to_string()),
                ("PRODUCT".to_string(), "S2 & L2A".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_gdal_metadata_malformed() {
        assert!(parse_gdal_metadata("<GDALMetadata><Item name=\"A\">1</Wrong>").is_err());
    }

    #[tokio::test]
    async fn test_metadata_cache_single_entry_per_key() {
        let cache = TiffMetadataCache::new(4, None);
        let result = cache
            .get_or_load("s3://b/missing.tif", || async { anyhow::bail!("404") })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_missing_local_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CogReader::new(NetworkConfig::default(), 8);
        let source = RasterSource::Local(dir.path().join("nope.tif"));
        assert!(reader.open(&source).await.is_err());
    }
}
