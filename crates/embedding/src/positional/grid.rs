//! Temporal-spatial position grid builders.
//!
//! Both builders emit one `(t, h, w)` triple per token for all
//! `t * ph * pw` tokens of the grid, shaped `[n_tokens, 3]` in `f32`.
//! Ordering matches the flattened token sequence: time-major, then row,
//! then column.

use candle_core::{bail, Device, Result, Tensor};

fn check_extents(t: usize, ph: usize, pw: usize) -> Result<()> {
    if t == 0 || ph == 0 || pw == 0 {
        bail!("grid extents must be positive, got T={t} pH={ph} pW={pw}");
    }
    Ok(())
}

fn build_matrix(
    t: usize,
    ph: usize,
    pw: usize,
    h_scale: f32,
    w_scale: f32,
    device: &Device,
) -> Result<Tensor> {
    let n_tokens = t * ph * pw;
    let mut data = Vec::with_capacity(n_tokens * 3);
    for ti in 0..t {
        for hi in 0..ph {
            for wi in 0..pw {
                data.push(ti as f32);
                data.push(hi as f32 * h_scale);
                data.push(wi as f32 * w_scale);
            }
        }
    }
    Tensor::from_vec(data, (n_tokens, 3), device)
}

/// Build the raw position matrix for a `t x ph x pw` grid.
///
/// Coordinates are the plain grid indices: each row is `(ti, hi, wi)` with
/// `ti in [0, t)`, `hi in [0, ph)`, `wi in [0, pw)`.
pub fn create_position_matrix(t: usize, ph: usize, pw: usize, device: &Device) -> Result<Tensor> {
    check_extents(t, ph, pw)?;
    build_matrix(t, ph, pw, 1.0, 1.0, device)
}

/// Build a position matrix whose spatial coordinates are interpolated to a
/// fixed target area.
///
/// Spatial rows and columns are multiplied by `sqrt(target_area / (ph * pw))`
/// so rotary positions stay comparable when the frame resolution changes.
/// The temporal coordinate is left untouched. Raster order and shape match
/// [`create_position_matrix`].
pub fn create_position_matrix_scaled(
    t: usize,
    ph: usize,
    pw: usize,
    target_area: f64,
    device: &Device,
) -> Result<Tensor> {
    check_extents(t, ph, pw)?;
    if target_area <= 0.0 {
        bail!("target_area must be positive, got {target_area}");
    }
    let scale = (target_area / (ph as f64 * pw as f64)).sqrt() as f32;
    build_matrix(t, ph, pw, scale, scale, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn raster_order_and_ranges() -> Result<()> {
        let device = Device::Cpu;
        let (t, ph, pw) = (2, 3, 5);
        let pos = create_position_matrix(t, ph, pw, &device)?;
        assert_eq!(pos.dims(), &[t * ph * pw, 3]);

        let rows = pos.to_vec2::<f32>()?;
        let mut idx = 0;
        for ti in 0..t {
            for hi in 0..ph {
                for wi in 0..pw {
                    assert_eq!(rows[idx], vec![ti as f32, hi as f32, wi as f32]);
                    idx += 1;
                }
            }
        }
        for row in &rows {
            assert!(row[0] >= 0.0 && row[0] < t as f32);
            assert!(row[1] >= 0.0 && row[1] < ph as f32);
            assert!(row[2] >= 0.0 && row[2] < pw as f32);
        }
        Ok(())
    }

    #[test]
    fn scaled_matrix_scales_spatial_axes_only() -> Result<()> {
        let device = Device::Cpu;
        let (t, ph, pw) = (2, 4, 8);
        let target_area = 128.0;
        let scale = (target_area / (ph as f64 * pw as f64)).sqrt() as f32;

        let raw = create_position_matrix(t, ph, pw, &device)?.to_vec2::<f32>()?;
        let scaled =
            create_position_matrix_scaled(t, ph, pw, target_area, &device)?.to_vec2::<f32>()?;

        for (a, b) in raw.iter().zip(scaled.iter()) {
            assert_eq!(a[0], b[0]);
            assert!((a[1] * scale - b[1]).abs() < 1e-5);
            assert!((a[2] * scale - b[2]).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn zero_extent_rejected() {
        let device = Device::Cpu;
        assert!(create_position_matrix(0, 3, 5, &device).is_err());
        assert!(create_position_matrix(2, 0, 5, &device).is_err());
        assert!(create_position_matrix(2, 3, 0, &device).is_err());
        assert!(create_position_matrix_scaled(2, 3, 5, 0.0, &device).is_err());
    }
}
