//! BMP codec.
//!
//! Accepts uncompressed (`BI_RGB`/`BI_BITFIELDS`) 8-, 24- and 32-bit
//! bitmaps. Rows on disk are stored bottom to top and padded to 4-byte
//! multiples; all header fields are little-endian. An 8-bit image whose
//! palette is the identity gray ramp loads as `Mono8`, any other palette
//! as `Pal8`; 24- and 32-bit data loads as `Rgb8` (the 4th byte of 32-bit
//! pixels is dropped).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::error::{Error, Result};
use crate::image::{Image, Palette, PixelFormat};

const BMP_MAGIC: u16 = 0x4D42; // "BM"
const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;
const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;
const PALETTE_LEN_BYTES: u32 = 256 * 4;

// least multiple of 4 that is >= x
fn up4mult(x: u32) -> u32 {
    (x + 3) / 4 * 4
}

struct BmpHeaders {
    off_bits: u32,
    info_header_size: u32,
    width: u32,
    height: u32,
    bits_per_pixel: u16,
    clr_used: u32,
}

fn read_headers<R: Read>(r: &mut R, path: &Path) -> Result<BmpHeaders> {
    let io_err = |e| Error::io(path, e);

    let magic = r.read_u16::<LittleEndian>().map_err(io_err)?;
    let _file_size = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let _reserved = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let off_bits = r.read_u32::<LittleEndian>().map_err(io_err)?;

    let info_header_size = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let width = r.read_i32::<LittleEndian>().map_err(io_err)?;
    let height = r.read_i32::<LittleEndian>().map_err(io_err)?;
    let planes = r.read_u16::<LittleEndian>().map_err(io_err)?;
    let bits_per_pixel = r.read_u16::<LittleEndian>().map_err(io_err)?;
    let compression = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let _size_image = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let _x_ppm = r.read_i32::<LittleEndian>().map_err(io_err)?;
    let _y_ppm = r.read_i32::<LittleEndian>().map_err(io_err)?;
    let clr_used = r.read_u32::<LittleEndian>().map_err(io_err)?;
    let _clr_important = r.read_u32::<LittleEndian>().map_err(io_err)?;

    if magic != BMP_MAGIC {
        return Err(Error::format("not a BMP file"));
    }
    if width <= 0 || height <= 0 || planes != 1 {
        return Err(Error::format("malformed BMP header"));
    }
    if !matches!(bits_per_pixel, 8 | 24 | 32) {
        return Err(Error::format(format!("unsupported BMP bit depth: {bits_per_pixel}")));
    }
    if compression != BI_RGB && compression != BI_BITFIELDS {
        return Err(Error::format("compressed BMP files are not supported"));
    }

    Ok(BmpHeaders {
        off_bits,
        info_header_size,
        width: width as u32,
        height: height as u32,
        bits_per_pixel,
        clr_used,
    })
}

pub fn load(path: &Path) -> Result<Image> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);
    let hdr = read_headers(&mut r, path)?;
    let io_err = |e| Error::io(path, e);

    debug!(
        "loading BMP {}: {}x{} @ {} bpp",
        path.display(),
        hdr.width,
        hdr.height,
        hdr.bits_per_pixel
    );

    if hdr.bits_per_pixel == 8 {
        let num_pal_entries = if hdr.clr_used == 0 { 256 } else { hdr.clr_used as usize };

        // the palette follows the info header
        r.seek(SeekFrom::Start(u64::from(FILE_HEADER_LEN + hdr.info_header_size)))
            .map_err(io_err)?;
        let mut bgr_pal = vec![0u8; num_pal_entries * 4];
        r.read_exact(&mut bgr_pal).map_err(io_err)?;

        let is_gray_ramp = num_pal_entries == 256
            && (0..256).all(|i| {
                bgr_pal[4 * i] == i as u8
                    && bgr_pal[4 * i + 1] == i as u8
                    && bgr_pal[4 * i + 2] == i as u8
            });

        let format = if is_gray_ramp { PixelFormat::Mono8 } else { PixelFormat::Pal8 };
        let mut img = Image::new(hdr.width, hdr.height, format);

        if format == PixelFormat::Pal8 {
            let mut pal = Palette::gray_ramp();
            for i in 0..num_pal_entries {
                pal.0[3 * i] = bgr_pal[4 * i + 2];
                pal.0[3 * i + 1] = bgr_pal[4 * i + 1];
                pal.0[3 * i + 2] = bgr_pal[4 * i];
            }
            *img.buffer_mut().palette_mut().unwrap() = pal;
        }

        let stride = up4mult(hdr.width);
        let skip = (stride - hdr.width) as i64;

        r.seek(SeekFrom::Start(u64::from(hdr.off_bits))).map_err(io_err)?;
        for y in (0..hdr.height).rev() {
            r.read_exact(img.row_mut(y)).map_err(io_err)?;
            if skip > 0 {
                r.seek(SeekFrom::Current(skip)).map_err(io_err)?;
            }
        }
        Ok(img)
    } else {
        let src_bpp = (hdr.bits_per_pixel / 8) as usize;
        let mut img = Image::new(hdr.width, hdr.height, PixelFormat::Rgb8);

        let stride = up4mult(hdr.width * src_bpp as u32);
        let skip = (stride - hdr.width * src_bpp as u32) as i64;
        let mut line = vec![0u8; hdr.width as usize * src_bpp];

        r.seek(SeekFrom::Start(u64::from(hdr.off_bits))).map_err(io_err)?;
        for y in (0..hdr.height).rev() {
            r.read_exact(&mut line).map_err(io_err)?;
            let dest = img.row_mut(y);
            if src_bpp == 3 {
                for x in 0..hdr.width as usize {
                    dest[3 * x] = line[3 * x + 2];
                    dest[3 * x + 1] = line[3 * x + 1];
                    dest[3 * x + 2] = line[3 * x];
                }
            } else {
                // 32-bit: drop the 4th byte of each pixel
                for x in 0..hdr.width as usize {
                    dest[3 * x] = line[4 * x + 2];
                    dest[3 * x + 1] = line[4 * x + 1];
                    dest[3 * x + 2] = line[4 * x];
                }
            }
            if skip > 0 {
                r.seek(SeekFrom::Current(skip)).map_err(io_err)?;
            }
        }
        Ok(img)
    }
}

/// Saves `Mono8`, `Pal8` or `Rgb8` data as an uncompressed BMP. A palette
/// is written for both palettized and mono images (the gray ramp for the
/// latter).
pub fn save(path: &Path, img: &Image) -> Result<()> {
    let format = img.pixel_format();
    if !matches!(format, PixelFormat::Mono8 | PixelFormat::Pal8 | PixelFormat::Rgb8) {
        return Err(Error::invalid_arg(format!("cannot save {format:?} as BMP")));
    }

    let bpp = format.bytes_per_pixel() as u32;
    let stride = up4mult(img.width() * bpp);
    let has_palette = matches!(format, PixelFormat::Mono8 | PixelFormat::Pal8);

    let mut off_bits = FILE_HEADER_LEN + INFO_HEADER_LEN;
    let mut file_size = off_bits + img.height() * stride;
    if has_palette {
        off_bits += PALETTE_LEN_BYTES;
        file_size += PALETTE_LEN_BYTES;
    }

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io_err = |e| Error::io(path, e);

    w.write_u16::<LittleEndian>(BMP_MAGIC).map_err(io_err)?;
    w.write_u32::<LittleEndian>(file_size).map_err(io_err)?;
    w.write_u32::<LittleEndian>(0).map_err(io_err)?;
    w.write_u32::<LittleEndian>(off_bits).map_err(io_err)?;

    w.write_u32::<LittleEndian>(INFO_HEADER_LEN).map_err(io_err)?;
    w.write_i32::<LittleEndian>(img.width() as i32).map_err(io_err)?;
    w.write_i32::<LittleEndian>(img.height() as i32).map_err(io_err)?;
    w.write_u16::<LittleEndian>(1).map_err(io_err)?;
    w.write_u16::<LittleEndian>((bpp * 8) as u16).map_err(io_err)?;
    w.write_u32::<LittleEndian>(BI_RGB).map_err(io_err)?;
    w.write_u32::<LittleEndian>(0).map_err(io_err)?;
    w.write_i32::<LittleEndian>(1000).map_err(io_err)?;
    w.write_i32::<LittleEndian>(1000).map_err(io_err)?;
    w.write_u32::<LittleEndian>(0).map_err(io_err)?;
    w.write_u32::<LittleEndian>(0).map_err(io_err)?;

    if has_palette {
        let mut bgr_pal = [0u8; PALETTE_LEN_BYTES as usize];
        match img.palette() {
            Some(pal) if format == PixelFormat::Pal8 => {
                for i in 0..256 {
                    bgr_pal[4 * i] = pal.0[3 * i + 2];
                    bgr_pal[4 * i + 1] = pal.0[3 * i + 1];
                    bgr_pal[4 * i + 2] = pal.0[3 * i];
                }
            }
            _ => {
                for i in 0..256 {
                    bgr_pal[4 * i] = i as u8;
                    bgr_pal[4 * i + 1] = i as u8;
                    bgr_pal[4 * i + 2] = i as u8;
                }
            }
        }
        w.write_all(&bgr_pal).map_err(io_err)?;
    }

    let skip = (stride - img.width() * bpp) as usize;
    let padding = [0u8; 3];
    let mut line = vec![0u8; img.width() as usize * bpp as usize];

    for y in (0..img.height()).rev() {
        let src = img.row(y);
        if format == PixelFormat::Rgb8 {
            for x in 0..img.width() as usize {
                line[3 * x] = src[3 * x + 2];
                line[3 * x + 1] = src[3 * x + 1];
                line[3 * x + 2] = src[3 * x];
            }
            w.write_all(&line).map_err(io_err)?;
        } else {
            w.write_all(src).map_err(io_err)?;
        }
        if skip > 0 {
            w.write_all(&padding[..skip]).map_err(io_err)?;
        }
    }

    w.flush().map_err(io_err)
}

/// Reads only the dimensions from a BMP header.
pub fn dimensions(path: &Path) -> Result<(u32, u32)> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);
    let hdr = read_headers(&mut r, path)?;
    Ok((hdr.width, hdr.height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mono8_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mono.bmp");

        let mut img = Image::new(3, 2, PixelFormat::Mono8);
        img.row_mut(0).copy_from_slice(&[0, 127, 255]);
        img.row_mut(1).copy_from_slice(&[10, 20, 30]);
        save(&path, &img).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono8);
        assert_eq!(loaded.row(0), img.row(0));
        assert_eq!(loaded.row(1), img.row(1));
        assert_eq!(dimensions(&path).unwrap(), (3, 2));
    }

    #[test]
    fn rgb8_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rgb.bmp");

        let mut img = Image::new(2, 2, PixelFormat::Rgb8);
        img.row_mut(0).copy_from_slice(&[255, 0, 0, 0, 255, 0]);
        img.row_mut(1).copy_from_slice(&[0, 0, 255, 10, 20, 30]);
        save(&path, &img).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Rgb8);
        assert_eq!(loaded.row(0), img.row(0));
        assert_eq!(loaded.row(1), img.row(1));
    }

    #[test]
    fn custom_palette_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pal.bmp");

        let mut img = Image::new(2, 1, PixelFormat::Pal8);
        let mut pal = Palette::gray_ramp();
        pal.0[0] = 11;
        pal.0[1] = 22;
        pal.0[2] = 33;
        *img.buffer_mut().palette_mut().unwrap() = pal;
        img.row_mut(0).copy_from_slice(&[0, 5]);
        save(&path, &img).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Pal8);
        assert_eq!(loaded.row(0), &[0, 5]);
        let pal = loaded.palette().unwrap();
        assert_eq!(&pal.0[..3], &[11, 22, 33]);
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bmp");
        std::fs::write(&path, b"certainly not a bitmap").unwrap();
        assert!(load(&path).is_err());
    }
}
