//! Restricted-area polygon and the point-in-polygon test used for breaches.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Default restricted area: the right-hand middle band of the frame.
pub const DEFAULT_ROI: [(f64, f64); 4] =
    [(0.55, 0.35), (0.90, 0.35), (0.90, 0.75), (0.55, 0.75)];

#[derive(Debug, Error, PartialEq)]
pub enum RoiError {
    #[error("a region needs at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("point ({x}, {y}) is outside the normalized range 0..=1")]
    OutOfRange { x: f64, y: f64 },
    #[error("cannot parse region point {0:?}, expected \"x,y\"")]
    Parse(String),
}

/// Polygon in normalized (0..=1) frame coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Roi {
    points: Vec<(f64, f64)>,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            points: DEFAULT_ROI.to_vec(),
        }
    }
}

impl Roi {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, RoiError> {
        if points.len() < 3 {
            return Err(RoiError::TooFewPoints(points.len()));
        }
        for &(x, y) in &points {
            if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
                return Err(RoiError::OutOfRange { x, y });
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Scale to the pixel grid of a `width` x `height` frame, truncating.
    pub fn to_pixels(&self, width: i32, height: i32) -> PixelPolygon {
        PixelPolygon {
            points: self
                .points
                .iter()
                .map(|&(x, y)| ((x * width as f64) as i32, (y * height as f64) as i32))
                .collect(),
        }
    }
}

impl FromStr for Roi {
    type Err = RoiError;

    /// Parses `"x,y;x,y;x,y"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let points = s
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (x, y) = pair
                    .split_once(',')
                    .ok_or_else(|| RoiError::Parse(pair.to_string()))?;
                let x = x
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| RoiError::Parse(pair.to_string()))?;
                let y = y
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| RoiError::Parse(pair.to_string()))?;
                Ok((x, y))
            })
            .collect::<Result<Vec<_>, RoiError>>()?;
        Roi::new(points)
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (x, y)) in self.points.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{x},{y}")?;
        }
        Ok(())
    }
}

/// ROI in pixel space for one particular frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelPolygon {
    pub points: Vec<(i32, i32)>,
}

impl PixelPolygon {
    /// True when (x, y) lies inside the polygon or on its outline.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.points.len();
        if n < 3 || !x.is_finite() || !y.is_finite() {
            return false;
        }
        let (x, y) = (x as f64, y as f64);

        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.points[i].0 as f64, self.points[i].1 as f64);
            let (xj, yj) = (self.points[j].0 as f64, self.points[j].1 as f64);
            if on_segment((xi, yi), (xj, yj), (x, y)) {
                return true;
            }
            j = i;
        }

        // Ray casting
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.points[i].0 as f64, self.points[i].1 as f64);
            let (xj, yj) = (self.points[j].0 as f64, self.points[j].1 as f64);
            if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > 1e-9 {
        return false;
    }
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_region_scales_to_640x480() {
        let poly = Roi::default().to_pixels(640, 480);
        assert_eq!(poly.points, vec![(352, 168), (576, 168), (576, 360), (352, 360)]);
    }

    #[test]
    fn pixel_conversion_truncates() {
        let roi = Roi::new(vec![(0.5, 0.5), (0.999, 0.5), (0.999, 0.999)]).unwrap();
        let poly = roi.to_pixels(3, 3);
        assert_eq!(poly.points, vec![(1, 1), (2, 1), (2, 2)]);
    }

    #[test]
    fn inside_outside_and_boundary() {
        let poly = Roi::default().to_pixels(640, 480);
        assert!(poly.contains(500.0, 200.0));
        assert!(!poly.contains(100.0, 200.0));
        assert!(!poly.contains(500.0, 400.0));
        // Edges and corners count as inside.
        assert!(poly.contains(352.0, 250.0));
        assert!(poly.contains(576.0, 360.0));
        assert!(poly.contains(400.0, 168.0));
    }

    #[test]
    fn concave_polygon() {
        // Gap cut into the bottom edge between x=3 and x=7.
        let poly = PixelPolygon {
            points: vec![
                (0, 0),
                (10, 0),
                (10, 10),
                (7, 10),
                (7, 3),
                (3, 3),
                (3, 10),
                (0, 10),
            ],
        };
        assert!(poly.contains(1.0, 8.0));
        assert!(poly.contains(9.0, 8.0));
        assert!(!poly.contains(5.0, 8.0));
        assert!(poly.contains(5.0, 1.0));
    }

    #[test]
    fn non_finite_points_are_outside() {
        let poly = Roi::default().to_pixels(640, 480);
        assert!(!poly.contains(f32::NAN, 200.0));
    }

    #[test]
    fn parses_and_validates_text_form() {
        let roi: Roi = "0.55,0.35; 0.9,0.35; 0.9,0.75; 0.55,0.75".parse().unwrap();
        assert_eq!(roi, Roi::default());
        assert_eq!(roi.to_string().parse::<Roi>().unwrap(), roi);

        assert_eq!("0,0;1,1".parse::<Roi>(), Err(RoiError::TooFewPoints(2)));
        assert!(matches!(
            "0,0;1.5,0;1,1".parse::<Roi>(),
            Err(RoiError::OutOfRange { .. })
        ));
        assert!(matches!("0,0;a,b;1,1".parse::<Roi>(), Err(RoiError::Parse(_))));
    }
}
