#[cfg(test)]
mod units {
    use crate::numerics::{interp, minimize, Method};

    #[test]
    fn interp_matches_linear_segments_and_clamps_at_the_ends() {
        let xs = [0.0, 10.0, 20.0];
        let ys = [0.0, 5.0, 7.0];

        assert_eq!(interp(-1.0, &xs, &ys), 0.0);
        assert_eq!(interp(0.0, &xs, &ys), 0.0);
        assert!((interp(5.0, &xs, &ys) - 2.5).abs() < 1e-12);
        assert!((interp(15.0, &xs, &ys) - 6.0).abs() < 1e-12);
        assert_eq!(interp(25.0, &xs, &ys), 7.0);
    }

    #[test]
    fn nelder_mead_finds_the_minimum_of_a_shifted_quadratic() {
        let result = minimize(
            |x| (x[0] - 3.0).powi(2) + 1.0,
            &[0.5],
            Some(&[(0.0, 10.0)]),
            Method::NelderMead,
        );

        assert!(result.converged, "{}", result.message);
        assert!((result.x[0] - 3.0).abs() < 1e-4);
        assert!((result.fun - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nelder_mead_respects_bounds_when_the_minimum_is_outside() {
        let result = minimize(
            |x| (x[0] - 3.0).powi(2),
            &[0.5],
            Some(&[(0.0, 1.0)]),
            Method::NelderMead,
        );

        assert!((result.x[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn projected_gradient_solves_a_two_dimensional_bowl() {
        let result = minimize(
            |x| (x[0] - 1.0).powi(2) + 4.0 * (x[1] + 2.0).powi(2),
            &[5.0, 5.0],
            Some(&[(-10.0, 10.0), (-10.0, 10.0)]),
            Method::ProjectedGradient,
        );

        assert!((result.x[0] - 1.0).abs() < 1e-3);
        assert!((result.x[1] + 2.0).abs() < 1e-3);
    }

    #[test]
    fn projected_gradient_stays_inside_the_box() {
        let result = minimize(
            |x| x.iter().map(|v| v * v).sum(),
            &[4.0, 4.0],
            Some(&[(2.0, 6.0), (2.0, 6.0)]),
            Method::ProjectedGradient,
        );

        for value in &result.x {
            assert!(*value >= 2.0 - 1e-12 && *value <= 6.0 + 1e-12);
        }
        assert!((result.x[0] - 2.0).abs() < 1e-6);
    }
}
