use serde::{Deserialize, Serialize};

use super::EmptyIntersection;
use crate::error::StoreError;

/// Axis-aligned bounding box in lon/lat order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, other: &Bbox) -> bool {
        self.min_x <= other.min_x
            && self.max_x >= other.max_x
            && self.min_y <= other.min_y
            && self.max_y >= other.max_y
    }

    pub fn distance_to_point(&self, x: f64, y: f64) -> f64 {
        let dx = (self.min_x - x).max(0.0).max(x - self.max_x);
        let dy = (self.min_y - y).max(0.0).max(y - self.max_y);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Feature geometry. Spatial predicates evaluate on bounding boxes; exact
/// geometry math stays outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Point { x: f64, y: f64 },
    Polygon { exterior: Vec<[f64; 2]> },
}

impl Geometry {
    pub fn bbox(&self) -> Bbox {
        match self {
            Geometry::Point { x, y } => Bbox {
                min_x: *x,
                min_y: *y,
                max_x: *x,
                max_y: *y,
            },
            Geometry::Polygon { exterior } => {
                let mut b = Bbox {
                    min_x: f64::INFINITY,
                    min_y: f64::INFINITY,
                    max_x: f64::NEG_INFINITY,
                    max_y: f64::NEG_INFINITY,
                };
                for [x, y] in exterior {
                    b.min_x = b.min_x.min(*x);
                    b.min_y = b.min_y.min(*y);
                    b.max_x = b.max_x.max(*x);
                    b.max_y = b.max_y.max(*y);
                }
                b
            }
        }
    }

    pub fn from_bbox(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Geometry {
        Geometry::Polygon {
            exterior: vec![
                [min_x, min_y],
                [max_x, min_y],
                [max_x, max_y],
                [min_x, max_y],
                [min_x, min_y],
            ],
        }
    }

    /// Parses `POINT (x y)` and `POLYGON ((x y, x y, ...))`.
    pub fn from_wkt(wkt: &str) -> Result<Geometry, StoreError> {
        let bad = || StoreError::InvalidRequest(format!("unsupported WKT: {wkt}"));
        let trimmed = wkt.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("POINT") {
            let inner = rest.trim().strip_prefix('(').and_then(|s| s.strip_suffix(')'))
                .ok_or_else(bad)?;
            let mut nums = inner.split_whitespace().map(|n| n.parse::<f64>());
            match (nums.next(), nums.next(), nums.next()) {
                (Some(Ok(x)), Some(Ok(y)), None) => Ok(Geometry::Point { x, y }),
                _ => Err(bad()),
            }
        } else if let Some(rest) = upper.strip_prefix("POLYGON") {
            let inner = rest
                .trim()
                .strip_prefix("((")
                .and_then(|s| s.strip_suffix("))"))
                .ok_or_else(bad)?;
            let mut exterior = Vec::new();
            for pair in inner.split(',') {
                let mut nums = pair.split_whitespace().map(|n| n.parse::<f64>());
                match (nums.next(), nums.next(), nums.next()) {
                    (Some(Ok(x)), Some(Ok(y)), None) => exterior.push([x, y]),
                    _ => return Err(bad()),
                }
            }
            if exterior.len() < 3 {
                return Err(bad());
            }
            Ok(Geometry::Polygon { exterior })
        } else {
            Err(bad())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SpatialClause {
    Intersects(Geometry),
    Contains(Geometry),
    WithinDistance { x: f64, y: f64, distance: f64 },
}

impl SpatialClause {
    fn test(&self, g: &Geometry) -> bool {
        match self {
            SpatialClause::Intersects(roi) => roi.bbox().intersects(&g.bbox()),
            SpatialClause::Contains(roi) => roi.bbox().contains(&g.bbox()),
            SpatialClause::WithinDistance { x, y, distance } => {
                g.bbox().distance_to_point(*x, *y) <= *distance
            }
        }
    }

    /// Region every matching geometry must intersect; used for provable
    /// emptiness when combining filters.
    fn cover(&self) -> Bbox {
        match self {
            SpatialClause::Intersects(roi) | SpatialClause::Contains(roi) => roi.bbox(),
            SpatialClause::WithinDistance { x, y, distance } => Bbox {
                min_x: x - distance,
                min_y: y - distance,
                max_x: x + distance,
                max_y: y + distance,
            },
        }
    }
}

/// Conjunction of spatial clauses. Combining two filters concatenates their
/// clauses, so `test` stays exactly the conjunction of both.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpatialFilter {
    clauses: Vec<SpatialClause>,
}

impl SpatialFilter {
    pub fn intersects(roi: Geometry) -> Self {
        Self {
            clauses: vec![SpatialClause::Intersects(roi)],
        }
    }

    pub fn contains(roi: Geometry) -> Self {
        Self {
            clauses: vec![SpatialClause::Contains(roi)],
        }
    }

    pub fn within_distance(x: f64, y: f64, distance: f64) -> Self {
        Self {
            clauses: vec![SpatialClause::WithinDistance { x, y, distance }],
        }
    }

    pub fn test(&self, g: &Geometry) -> bool {
        self.clauses.iter().all(|c| c.test(g))
    }

    pub fn intersect(&self, other: &Self) -> Result<Self, EmptyIntersection> {
        for a in &self.clauses {
            for b in &other.clauses {
                if !a.cover().intersects(&b.cover()) {
                    return Err(EmptyIntersection);
                }
            }
        }
        let mut clauses = self.clauses.clone();
        clauses.extend(other.clauses.iter().cloned());
        Ok(Self { clauses })
    }
}
