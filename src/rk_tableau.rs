//! RKF54 coefficient tables: Dormand-Prince RK5(4)7 "FC"/"FM"/"FS" variants,
//! reproduced to full machine precision (see DESIGN.md for provenance).
//!
//! `dm_dtN = dm_dt(t1 + aN*h, m1 + h*kN)`, `kN = sum_{M<=N} dm_dtM*bNM`,
//! `Db - Da = sum dm_dtM*dcM`. `b62` is always 0.0; `a5`/`a6` are always 1.0.

/// Which of the three published embedded pairs to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RkMethod {
    /// Default: minimizes truncation error constant.
    Rkf54C,
    /// "Minimized error norm" variant.
    Rkf54M,
    /// "Stability" variant (larger stability region).
    Rkf54S,
}

/// The full 7-stage tableau for one of the three RKF54 variants.
#[derive(Debug, Clone, Copy)]
pub struct Tableau {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub a4: f64,
    // a5 = a6 = 1.0 for all three variants.
    pub b11: f64,
    pub b21: f64,
    pub b22: f64,
    pub b31: f64,
    pub b32: f64,
    pub b33: f64,
    pub b41: f64,
    pub b42: f64,
    pub b43: f64,
    pub b44: f64,
    pub b51: f64,
    pub b52: f64,
    pub b53: f64,
    pub b54: f64,
    pub b55: f64,
    pub b61: f64,
    // b62 = 0.0 for all three variants.
    pub b63: f64,
    pub b64: f64,
    pub b65: f64,
    pub b66: f64,
    pub dc1: f64,
    // dc2 = 0.0 (c^[2] = c[2] = 0.0 for all three variants).
    pub dc3: f64,
    pub dc4: f64,
    pub dc5: f64,
    pub dc6: f64,
    pub dc7: f64,
}

/// 547FC (the default): Dormand & Prince RK5(4)7FC.
pub const RK547FC: Tableau = Tableau {
    a1: 1.0 / 5.0,
    a2: 3.0 / 10.0,
    a3: 6.0 / 13.0,
    a4: 2.0 / 3.0,
    b11: 1.0 / 5.0,
    b21: 3.0 / 40.0,
    b22: 9.0 / 40.0,
    b31: 264.0 / 2197.0,
    b32: -90.0 / 2197.0,
    b33: 840.0 / 2197.0,
    b41: 932.0 / 3645.0,
    b42: -14.0 / 27.0,
    b43: 3256.0 / 5103.0,
    b44: 7436.0 / 25515.0,
    b51: -367.0 / 513.0,
    b52: 30.0 / 19.0,
    b53: 9940.0 / 5643.0,
    b54: -29575.0 / 8208.0,
    b55: 6615.0 / 3344.0,
    b61: 35.0 / 432.0,
    b63: 8500.0 / 14553.0,
    b64: -28561.0 / 84672.0,
    b65: 405.0 / 704.0,
    b66: 19.0 / 196.0,
    dc1: 11.0 / 108.0 - 35.0 / 432.0,
    dc3: 6250.0 / 14553.0 - 8500.0 / 14553.0,
    dc4: -2197.0 / 21168.0 - (-28561.0 / 84672.0),
    dc5: 81.0 / 176.0 - 405.0 / 704.0,
    dc6: 171.0 / 1960.0 - 19.0 / 196.0,
    dc7: 1.0 / 40.0,
};

/// 547FM: "minimized error norm" variant.
pub const RK547FM: Tableau = Tableau {
    a1: 1.0 / 5.0,
    a2: 3.0 / 10.0,
    a3: 4.0 / 5.0,
    a4: 8.0 / 9.0,
    b11: 1.0 / 5.0,
    b21: 3.0 / 40.0,
    b22: 9.0 / 40.0,
    b31: 44.0 / 45.0,
    b32: -56.0 / 15.0,
    b33: 32.0 / 9.0,
    b41: 19372.0 / 6561.0,
    b42: -25360.0 / 2187.0,
    b43: 64448.0 / 6561.0,
    b44: -212.0 / 729.0,
    b51: 9017.0 / 3168.0,
    b52: -355.0 / 33.0,
    b53: 46732.0 / 5247.0,
    b54: 49.0 / 176.0,
    b55: -5103.0 / 18656.0,
    b61: 35.0 / 384.0,
    b63: 500.0 / 1113.0,
    b64: 125.0 / 192.0,
    b65: -2187.0 / 6784.0,
    b66: 11.0 / 84.0,
    dc1: 5179.0 / 57600.0 - 35.0 / 384.0,
    dc3: 7571.0 / 16695.0 - 500.0 / 1113.0,
    dc4: 393.0 / 640.0 - 125.0 / 192.0,
    dc5: -92097.0 / 339200.0 - (-2187.0 / 6784.0),
    dc6: 187.0 / 2100.0 - 11.0 / 84.0,
    dc7: 1.0 / 40.0,
};

/// 547FS: "stability" variant (larger stability region).
pub const RK547FS: Tableau = Tableau {
    a1: 2.0 / 9.0,
    a2: 1.0 / 3.0,
    a3: 5.0 / 9.0,
    a4: 2.0 / 3.0,
    b11: 2.0 / 9.0,
    b21: 1.0 / 12.0,
    b22: 1.0 / 4.0,
    b31: 55.0 / 324.0,
    b32: -25.0 / 108.0,
    b33: 50.0 / 81.0,
    b41: 83.0 / 330.0,
    b42: -13.0 / 22.0,
    b43: 61.0 / 66.0,
    b44: 9.0 / 110.0,
    b51: -19.0 / 28.0,
    b52: 9.0 / 4.0,
    b53: 1.0 / 7.0,
    b54: -27.0 / 7.0,
    b55: 22.0 / 7.0,
    b61: 19.0 / 200.0,
    b63: 3.0 / 5.0,
    b64: -243.0 / 400.0,
    b65: 33.0 / 40.0,
    b66: 7.0 / 80.0,
    dc1: 431.0 / 5000.0 - 19.0 / 200.0,
    dc3: 333.0 / 500.0 - 3.0 / 5.0,
    dc4: -7857.0 / 10000.0 - (-243.0 / 400.0),
    dc5: 957.0 / 1000.0 - 33.0 / 40.0,
    dc6: 193.0 / 2000.0 - 7.0 / 80.0,
    dc7: -1.0 / 50.0,
};

impl RkMethod {
    pub fn tableau(self) -> &'static Tableau {
        match self {
            RkMethod::Rkf54C => &RK547FC,
            RkMethod::Rkf54M => &RK547FM,
            RkMethod::Rkf54S => &RK547FS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The b-rows of a consistent RK tableau sum to the corresponding `a`
    // node (consistency condition sum_j b_ij == a_i).
    fn check_consistency(t: &Tableau) {
        const EPS: f64 = 1e-13;
        assert!((t.b11 - t.a1).abs() < EPS);
        assert!((t.b21 + t.b22 - t.a2).abs() < EPS);
        assert!((t.b31 + t.b32 + t.b33 - t.a3).abs() < EPS);
        assert!((t.b41 + t.b42 + t.b43 + t.b44 - t.a4).abs() < EPS);
        assert!((t.b51 + t.b52 + t.b53 + t.b54 + t.b55 - 1.0).abs() < EPS);
        assert!((t.b61 + t.b63 + t.b64 + t.b65 + t.b66 - 1.0).abs() < EPS);
    }

    #[test]
    fn all_three_tableaus_are_consistent() {
        check_consistency(&RK547FC);
        check_consistency(&RK547FM);
        check_consistency(&RK547FS);
    }

    #[test]
    fn method_selects_matching_tableau() {
        assert_eq!(RkMethod::Rkf54C.tableau().a1, RK547FC.a1);
        assert_eq!(RkMethod::Rkf54M.tableau().a1, RK547FM.a1);
        assert_eq!(RkMethod::Rkf54S.tableau().a1, RK547FS.a1);
    }
}
