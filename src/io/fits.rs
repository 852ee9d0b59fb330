//! FITS codec (single-plane mono images).
//!
//! Headers are 2880-byte records of 80-character cards; image data is
//! big-endian and padded to a 2880-byte multiple. `BYTE_IMG`, `SHORT_IMG`
//! and `FLOAT_IMG` load as `Mono8`, `Mono16` and `Mono32f`. Signed 16-bit
//! data uses the conventional `BZERO = 32768` offset; if negative values
//! remain after applying it, the image is loaded as float instead. On the
//! float path negatives clamp to zero, and values above 1.0 are either
//! clamped or the whole image is rescaled so the maximum becomes 1.0.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::debug;

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

const RECORD_LEN: usize = 2880;
const CARD_LEN: usize = 80;

const BITPIX_BYTE: i32 = 8;
const BITPIX_SHORT: i32 = 16;
const BITPIX_FLOAT: i32 = -32;

struct FitsHeader {
    bitpix: i32,
    width: u32,
    height: u32,
    bzero: f64,
    bscale: f64,
}

fn parse_header<R: Read>(r: &mut R, path: &Path) -> Result<FitsHeader> {
    let mut bitpix = None;
    let mut naxis = None;
    let mut axes = [0u32; 2];
    let mut bzero = 0.0f64;
    let mut bscale = 1.0f64;

    let mut record = [0u8; RECORD_LEN];
    'records: loop {
        r.read_exact(&mut record).map_err(|e| Error::io(path, e))?;

        for card in record.chunks_exact(CARD_LEN) {
            let keyword = std::str::from_utf8(&card[..8]).unwrap_or("").trim();
            if keyword == "END" {
                break 'records;
            }
            let value = card
                .get(10..)
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(|v| v.split('/').next().unwrap_or("").trim().to_string())
                .unwrap_or_default();

            match keyword {
                "SIMPLE" => {
                    if !value.starts_with('T') {
                        return Err(Error::format("not a standard FITS file"));
                    }
                }
                "BITPIX" => bitpix = value.parse::<i32>().ok(),
                "NAXIS" => naxis = value.parse::<u32>().ok(),
                "NAXIS1" => axes[0] = value.parse().unwrap_or(0),
                "NAXIS2" => axes[1] = value.parse().unwrap_or(0),
                "BZERO" => bzero = value.parse().unwrap_or(0.0),
                "BSCALE" => bscale = value.parse().unwrap_or(1.0),
                _ => {}
            }
        }
    }

    let bitpix = bitpix.ok_or_else(|| Error::format("FITS header lacks BITPIX"))?;
    let naxis = naxis.ok_or_else(|| Error::format("FITS header lacks NAXIS"))?;
    if !(1..=3).contains(&naxis) || axes[0] == 0 || axes[1] == 0 {
        return Err(Error::format(format!("unsupported FITS axis count: {naxis}")));
    }
    if !matches!(bitpix, BITPIX_BYTE | BITPIX_SHORT | BITPIX_FLOAT) {
        return Err(Error::format(format!("unsupported FITS BITPIX: {bitpix}")));
    }

    Ok(FitsHeader { bitpix, width: axes[0], height: axes[1], bzero, bscale })
}

/// Loads the first image plane of a FITS file.
///
/// With `normalize` set, float data whose maximum exceeds 1.0 is rescaled
/// so the maximum becomes exactly 1.0; otherwise it is clamped.
pub fn load(path: &Path, normalize: bool) -> Result<Image> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);
    let hdr = parse_header(&mut r, path)?;

    debug!(
        "loading FITS {}: {}x{} BITPIX {}",
        path.display(),
        hdr.width,
        hdr.height,
        hdr.bitpix
    );

    let num_pixels = hdr.width as usize * hdr.height as usize;
    let bytes_per_value = (hdr.bitpix.unsigned_abs() / 8) as usize;
    let mut raw = vec![0u8; num_pixels * bytes_per_value];
    r.read_exact(&mut raw).map_err(|e| Error::io(path, e))?;

    // Physical value of pixel i, after the standard linear scaling.
    let physical: Box<dyn Fn(usize) -> f64 + '_> = match hdr.bitpix {
        BITPIX_BYTE => Box::new(|i| raw[i] as f64 * hdr.bscale + hdr.bzero),
        BITPIX_SHORT => {
            Box::new(|i| BigEndian::read_i16(&raw[2 * i..]) as f64 * hdr.bscale + hdr.bzero)
        }
        BITPIX_FLOAT => {
            Box::new(|i| BigEndian::read_f32(&raw[4 * i..]) as f64 * hdr.bscale + hdr.bzero)
        }
        _ => unreachable!(),
    };

    // Integer modes keep their bit depth unless negative values force the
    // float fallback.
    let as_float = match hdr.bitpix {
        BITPIX_BYTE => false,
        BITPIX_SHORT => (0..num_pixels).any(|i| physical(i) < 0.0),
        _ => true,
    };

    // FITS stores rows bottom to top.
    let row_of = |i: usize| hdr.height - 1 - (i / hdr.width as usize) as u32;
    let col_of = |i: usize| i % hdr.width as usize;

    if !as_float {
        match hdr.bitpix {
            BITPIX_BYTE => {
                let mut img = Image::new(hdr.width, hdr.height, PixelFormat::Mono8);
                for i in 0..num_pixels {
                    img.row_mut(row_of(i))[col_of(i)] = physical(i).clamp(0.0, 255.0) as u8;
                }
                Ok(img)
            }
            BITPIX_SHORT => {
                let mut img = Image::new(hdr.width, hdr.height, PixelFormat::Mono16);
                for i in 0..num_pixels {
                    img.row_as_mut::<u16>(row_of(i))[col_of(i)] =
                        physical(i).clamp(0.0, 65535.0) as u16;
                }
                Ok(img)
            }
            _ => unreachable!(),
        }
    } else {
        let mut values: Vec<f32> = (0..num_pixels).map(|i| physical(i) as f32).collect();

        let mut maxval = 0.0f32;
        for v in values.iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            } else if *v > maxval {
                maxval = *v;
            }
        }
        if maxval > 1.0 {
            if normalize {
                let inv = 1.0 / maxval;
                for v in values.iter_mut() {
                    *v *= inv;
                }
            } else {
                for v in values.iter_mut() {
                    *v = v.min(1.0);
                }
            }
        }

        let mut img = Image::new(hdr.width, hdr.height, PixelFormat::Mono32f);
        for i in 0..num_pixels {
            img.row_as_mut::<f32>(row_of(i))[col_of(i)] = values[i];
        }
        Ok(img)
    }
}

fn write_card(record: &mut Vec<u8>, text: &str) {
    let mut card = [b' '; CARD_LEN];
    card[..text.len()].copy_from_slice(text.as_bytes());
    record.extend_from_slice(&card);
}

/// Saves a mono image as single-plane FITS with the matching bit depth.
pub fn save(path: &Path, img: &Image) -> Result<()> {
    let bitpix = match img.pixel_format() {
        PixelFormat::Mono8 => BITPIX_BYTE,
        PixelFormat::Mono16 => BITPIX_SHORT,
        PixelFormat::Mono32f => BITPIX_FLOAT,
        other => return Err(Error::invalid_arg(format!("cannot save {other:?} as FITS"))),
    };

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io_err = |e| Error::io(path, e);

    let mut header = Vec::with_capacity(RECORD_LEN);
    write_card(&mut header, "SIMPLE  =                    T");
    write_card(&mut header, &format!("BITPIX  = {:>20}", bitpix));
    write_card(&mut header, "NAXIS   =                    2");
    write_card(&mut header, &format!("NAXIS1  = {:>20}", img.width()));
    write_card(&mut header, &format!("NAXIS2  = {:>20}", img.height()));
    if bitpix == BITPIX_SHORT {
        // unsigned 16-bit data is stored as signed with the standard offset
        write_card(&mut header, "BZERO   =                32768");
        write_card(&mut header, "BSCALE  =                    1");
    }
    write_card(&mut header, "END");
    header.resize(RECORD_LEN, b' ');
    w.write_all(&header).map_err(io_err)?;

    let mut written = 0usize;
    for y in (0..img.height()).rev() {
        match img.pixel_format() {
            PixelFormat::Mono8 => {
                w.write_all(img.row(y)).map_err(io_err)?;
                written += img.width() as usize;
            }
            PixelFormat::Mono16 => {
                for &v in img.row_as::<u16>(y) {
                    w.write_i16::<BigEndian>((v as i32 - 32768) as i16).map_err(io_err)?;
                }
                written += 2 * img.width() as usize;
            }
            PixelFormat::Mono32f => {
                for &v in img.row_as::<f32>(y) {
                    w.write_f32::<BigEndian>(v).map_err(io_err)?;
                }
                written += 4 * img.width() as usize;
            }
            _ => unreachable!(),
        }
    }

    // pad the data section to a whole record
    let tail = written % RECORD_LEN;
    if tail != 0 {
        w.write_all(&vec![0u8; RECORD_LEN - tail]).map_err(io_err)?;
    }
    w.flush().map_err(io_err)
}

pub fn dimensions(path: &Path) -> Result<(u32, u32)> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);
    let hdr = parse_header(&mut r, path)?;
    Ok((hdr.width, hdr.height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mono8_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.fits");

        let mut img = Image::new(3, 2, PixelFormat::Mono8);
        img.row_mut(0).copy_from_slice(&[0, 127, 255]);
        img.row_mut(1).copy_from_slice(&[10, 20, 30]);
        save(&path, &img).unwrap();

        let loaded = load(&path, false).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono8);
        assert_eq!(loaded.row(0), img.row(0));
        assert_eq!(loaded.row(1), img.row(1));
        assert_eq!(dimensions(&path).unwrap(), (3, 2));
    }

    #[test]
    fn float_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.fits");

        let mut img = Image::new(2, 2, PixelFormat::Mono32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[0.0, 0.5]);
        img.row_as_mut::<f32>(1).copy_from_slice(&[0.25, 1.0]);
        save(&path, &img).unwrap();

        let loaded = load(&path, false).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono32f);
        assert_eq!(loaded.row_as::<f32>(0), img.row_as::<f32>(0));
        assert_eq!(loaded.row_as::<f32>(1), img.row_as::<f32>(1));
    }

    #[test]
    fn float_values_above_one_normalize_or_clamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.fits");

        let mut img = Image::new(2, 1, PixelFormat::Mono32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[1.0, 4.0]);
        save(&path, &img).unwrap();

        let normalized = load(&path, true).unwrap();
        assert_eq!(normalized.row_as::<f32>(0), &[0.25, 1.0]);

        let clamped = load(&path, false).unwrap();
        assert_eq!(clamped.row_as::<f32>(0), &[1.0, 1.0]);
    }

    #[test]
    fn mono16_round_trip_uses_bzero_convention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.fits");

        let mut img = Image::new(2, 1, PixelFormat::Mono16);
        img.row_as_mut::<u16>(0).copy_from_slice(&[0, 65535]);
        save(&path, &img).unwrap();

        let loaded = load(&path, false).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono16);
        assert_eq!(loaded.row_as::<u16>(0), &[0, 65535]);
    }
}
