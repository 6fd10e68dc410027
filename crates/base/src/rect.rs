use {
    crate::Vec2,
    serde::{Deserialize, Serialize},
    std::ops::{Add, Sub},
};

/// Axis-aligned rectangle, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect<T> {
    pub origin: Vec2<T>,
    pub size: Vec2<T>,
}

impl<T> Rect<T> {
    pub const fn new(origin: Vec2<T>, size: Vec2<T>) -> Self {
        Self { origin, size }
    }
}

impl<T: Add<Output = T> + Copy> Rect<T> {
    pub fn min(&self) -> Vec2<T> {
        self.origin
    }

    pub fn max(&self) -> Vec2<T> {
        self.origin + self.size
    }
}

impl<T: Sub<Output = T> + Copy> Rect<T> {
    pub fn from_min_max(min: Vec2<T>, max: Vec2<T>) -> Self {
        Self {
            origin: min,
            size: max - min,
        }
    }
}

impl<T: Add<Output = T> + Sub<Output = T> + PartialOrd + Copy> Rect<T> {
    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(&self, other: &Rect<T>) -> Rect<T> {
        let (a_min, a_max) = (self.min(), self.max());
        let (b_min, b_max) = (other.min(), other.max());
        let min = Vec2::new(pick(a_min.x, b_min.x, true), pick(a_min.y, b_min.y, true));
        let max = Vec2::new(pick(a_max.x, b_max.x, false), pick(a_max.y, b_max.y, false));
        Rect::from_min_max(min, max)
    }

    pub fn contains(&self, point: Vec2<T>) -> bool {
        let (min, max) = (self.min(), self.max());
        point.x >= min.x && point.y >= min.y && point.x < max.x && point.y < max.y
    }
}

fn pick<T: PartialOrd + Copy>(a: T, b: T, smaller: bool) -> T {
    if (a < b) == smaller { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_encloses_both() {
        let a = Rect::new(Vec2::new(2, 3), Vec2::new(1, 1));
        let b = Rect::new(Vec2::new(5, 1), Vec2::new(2, 2));
        let u = a.union(&b);
        assert_eq!(u.min(), Vec2::new(2, 1));
        assert_eq!(u.max(), Vec2::new(7, 4));
    }

    #[test]
    fn test_contains_is_half_open() {
        let r = Rect::new(Vec2::new(0, 0), Vec2::new(4, 4));
        assert!(r.contains(Vec2::new(3, 3)));
        assert!(!r.contains(Vec2::new(4, 0)));
    }
}
