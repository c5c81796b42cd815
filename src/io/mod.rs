//! I/O: source addressing, windowed COG reads, and GeoTIFF output.

mod cog_reader;
pub mod geotiff;
mod staging;
mod store;

pub use cog_reader::{
    parse_gdal_metadata, parse_nodata, CogHandle, CogMetadata, CogReader, RasterData, TiffMetadataCache,
};
pub use geotiff::{is_valid_raster, read_band, BandRaster, GeoTiffOptions, RasterProfile};
pub use staging::StagedFile;
pub use store::{create_anonymous_store, parse_http_url, parse_s3_uri, RasterSource};
