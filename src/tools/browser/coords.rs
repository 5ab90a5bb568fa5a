//! 截图像素 → 交互坐标换算

/// 调用方坐标所在空间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// 截图 / OCR 像素，需要按设备像素比缩放
    Physical,
    /// 已经是 CSS 像素
    Logical,
}

impl CoordinateSpace {
    /// 参数 `coordinate_space` 为 "logical" / "css" 时视为逻辑坐标，其余一律按物理像素处理
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "logical" || v == "css" => CoordinateSpace::Logical,
            _ => CoordinateSpace::Physical,
        }
    }
}

/// 物理像素按设备像素比折算为逻辑坐标；ratio <= 1 或非有限值时原样返回
pub fn correct_coordinates(x: f64, y: f64, ratio: f64) -> (f64, f64) {
    if ratio.is_finite() && ratio > 1.0 {
        (x / ratio, y / ratio)
    } else {
        (x, y)
    }
}

pub fn to_logical(x: f64, y: f64, space: CoordinateSpace, ratio: f64) -> (f64, f64) {
    match space {
        CoordinateSpace::Logical => (x, y),
        CoordinateSpace::Physical => correct_coordinates(x, y, ratio),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retina_halves() {
        assert_eq!(correct_coordinates(200.0, 100.0, 2.0), (100.0, 50.0));
    }

    #[test]
    fn test_ratio_one_or_bogus_is_identity() {
        assert_eq!(correct_coordinates(200.0, 100.0, 1.0), (200.0, 100.0));
        assert_eq!(correct_coordinates(200.0, 100.0, 0.0), (200.0, 100.0));
        assert_eq!(correct_coordinates(200.0, 100.0, f64::NAN), (200.0, 100.0));
    }

    #[test]
    fn test_logical_space_skips_correction() {
        let space = CoordinateSpace::from_param(Some("logical"));
        assert_eq!(to_logical(30.0, 40.0, space, 2.0), (30.0, 40.0));
        assert_eq!(
            to_logical(30.0, 40.0, CoordinateSpace::from_param(None), 2.0),
            (15.0, 20.0)
        );
    }
}
