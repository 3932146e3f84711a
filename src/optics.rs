//! Scan planning and interface optics.
//!
//! Stateless math used when sizing a scan or characterizing the
//! beamsplitter. Everything works in plain `f64` with the unit in the name:
//! lengths in mm (cm where noted for absorption quantities), frequencies in
//! GHz for emission and Hz for rates, angles in radians.

use num_complex::Complex64;
use std::f64::consts::PI;

/// Speed of light, in mm/s.
const C_MM_PER_S: f64 = 2.997_924_58e11;

/// Free-space wavelength of an emission frequency, in mm.
pub fn wavelength_mm(frequency_ghz: f64) -> f64 {
    C_MM_PER_S / (frequency_ghz * 1e9)
}

/// Nyquist frequency for the given maximum signal frequency.
pub fn nyquist_frequency(max_frequency: f64) -> f64 {
    2.0 * max_frequency
}

/// Optical path difference increment resolving the given maximum
/// frequency, in mm.
pub fn opd_increment_mm(max_frequency_ghz: f64) -> f64 {
    wavelength_mm(max_frequency_ghz) / 2.0
}

/// Mirror velocity that places the interferogram fringe of the highest
/// frequency at the sampling Nyquist limit, in mm/s.
///
/// `folding` is the number of passes the beam makes off the moving mirror
/// (1 for a plain Michelson arm).
pub fn mirror_velocity_mm_s(sample_rate_hz: f64, max_frequency_ghz: f64, folding: f64) -> f64 {
    wavelength_mm(max_frequency_ghz) * sample_rate_hz / (4.0 * folding)
}

/// Highest fringe frequency faithfully sampled at the given rate, in Hz.
pub fn fringe_frequency_hz(sample_rate_hz: f64) -> f64 {
    sample_rate_hz / 2.0
}

/// Duration of one pass over the track, in seconds.
pub fn scan_time_s(track_length_mm: f64, velocity_mm_s: f64) -> f64 {
    track_length_mm / velocity_mm_s
}

/// Absorption coefficient from the extinction coefficient, in 1/cm.
pub fn absorption_coefficient_per_cm(kappa: f64, wavelength_cm: f64) -> f64 {
    4.0 * PI * kappa / wavelength_cm
}

/// Extinction coefficient from the absorption coefficient.
pub fn extinction_coefficient(alpha_per_cm: f64, wavelength_cm: f64) -> f64 {
    alpha_per_cm * wavelength_cm / (4.0 * PI)
}

/// Average of the two polarization components.
pub fn effective_power(s: f64, p: f64) -> f64 {
    (s + p) / 2.0
}

/// Fresnel amplitude coefficients at one interface.
#[derive(Clone, Copy, Debug)]
pub struct AmplitudeCoefficients {
    /// s-polarized reflection
    pub rs: Complex64,
    /// p-polarized reflection
    pub rp: Complex64,
    /// s-polarized transmission
    pub ts: Complex64,
    /// p-polarized transmission
    pub tp: Complex64,
}

/// A single interface between two media, the second possibly absorbing.
#[derive(Clone, Copy, Debug)]
pub struct Fresnel {
    n1: f64,
    n2: Complex64,
    cos_i: f64,
    cos_t: Complex64,
}

impl Fresnel {
    /// Interface from a medium of index `n1` into one of index `n2` (with
    /// optional extinction coefficient `kappa`), at incidence angle
    /// `theta_i` in radians.
    pub fn new(n1: f64, n2: f64, theta_i: f64, kappa: Option<f64>) -> Self {
        let n2 = Complex64::new(n2, kappa.unwrap_or(0.0));
        let cos_i = theta_i.cos();
        let theta_t = (Complex64::from(n1) / n2 * theta_i.sin()).asin();
        Self {
            n1,
            n2,
            cos_i,
            cos_t: theta_t.cos(),
        }
    }

    /// Amplitude reflection and transmission coefficients.
    pub fn amplitude_coefficients(&self) -> AmplitudeCoefficients {
        let n1 = Complex64::from(self.n1);
        let n2 = self.n2;
        let cos_i = Complex64::from(self.cos_i);
        let cos_t = self.cos_t;

        AmplitudeCoefficients {
            rs: (n1 * cos_i - n2 * cos_t) / (n1 * cos_i + n2 * cos_t),
            rp: (n2 * cos_i - n1 * cos_t) / (n2 * cos_i + n1 * cos_t),
            ts: 2.0 * n1 * cos_i / (n1 * cos_i + n2 * cos_t),
            tp: 2.0 * n1 * cos_i / (n2 * cos_i + n1 * cos_t),
        }
    }

    /// Power reflectances. Transmittances carry the index/angle factor and
    /// stay complex for an absorbing second medium.
    pub fn power_coefficients(&self) -> (f64, f64, Complex64, Complex64) {
        let amps = self.amplitude_coefficients();
        let rs = amps.rs.norm_sqr();
        let rp = amps.rp.norm_sqr();
        let factor = self.n2 * self.cos_t / (self.n1 * self.cos_i);
        let ts = factor * amps.ts.norm_sqr();
        let tp = factor * amps.tp.norm_sqr();
        (rs, rp, ts, tp)
    }
}

/// Multibeam power coefficients of a beamsplitter film.
#[derive(Clone, Copy, Debug)]
pub struct SplitterPower {
    /// s-polarized reflectance
    pub rs: f64,
    /// p-polarized reflectance
    pub rp: f64,
    /// s-polarized transmittance
    pub ts: f64,
    /// p-polarized transmittance
    pub tp: f64,
}

/// Beamsplitter efficiencies per polarization and averaged.
#[derive(Clone, Copy, Debug)]
pub struct SplitterEfficiency {
    /// s-polarized efficiency
    pub es: f64,
    /// p-polarized efficiency
    pub ep: f64,
    /// Polarization-averaged efficiency
    pub e_avg: f64,
}

/// A thin dielectric beamsplitter film, evaluated with multibeam
/// interference at a single wavenumber.
#[derive(Clone, Copy, Debug)]
pub struct BeamSplitter {
    interface: Fresnel,
    /// Single-pass phase thickness of the film
    phase: Complex64,
}

impl BeamSplitter {
    /// Film of index `n2` and `thickness_cm`, evaluated at wavenumber
    /// `sigma_per_cm`, embedded in a medium of index `n1` at incidence
    /// angle `theta_i` (radians).
    pub fn new(
        n1: f64,
        n2: f64,
        theta_i: f64,
        thickness_cm: f64,
        sigma_per_cm: f64,
        kappa: Option<f64>,
    ) -> Self {
        let interface = Fresnel::new(n1, n2, theta_i, kappa);
        let phase = 2.0 * PI * interface.n2 * sigma_per_cm * thickness_cm * interface.cos_t;
        Self { interface, phase }
    }

    /// Transmission amplitudes for the internal (film-to-medium) interface.
    fn internal_transmissions(&self) -> (Complex64, Complex64) {
        let n1 = Complex64::from(self.interface.n1);
        let n2 = self.interface.n2;
        let cos_i = Complex64::from(self.interface.cos_i);
        let cos_t = self.interface.cos_t;

        let ts_prime = 2.0 * n2 * cos_t / (n2 * cos_t + n1 * cos_i);
        let tp_prime = 2.0 * n2 * cos_t / (n2 * cos_i + n1 * cos_t);
        (ts_prime, tp_prime)
    }

    /// Multibeam power coefficients, summing the internal reflections of
    /// the film coherently.
    pub fn multibeam_power_coefficients(&self) -> SplitterPower {
        let amps = self.interface.amplitude_coefficients();
        let (ts_prime, tp_prime) = self.internal_transmissions();
        let round_trip = (Complex64::i() * 2.0 * self.phase).exp();
        let single_pass = (Complex64::i() * self.phase).exp();

        let denom_s = 1.0 - amps.rs * amps.rs * round_trip;
        let denom_p = 1.0 - amps.rp * amps.rp * round_trip;

        SplitterPower {
            rs: (amps.rs * (1.0 - round_trip) / denom_s).norm_sqr(),
            rp: (amps.rp * (1.0 - round_trip) / denom_p).norm_sqr(),
            ts: (amps.ts * ts_prime * single_pass / denom_s).norm_sqr(),
            tp: (amps.tp * tp_prime * single_pass / denom_p).norm_sqr(),
        }
    }

    /// Beamsplitter efficiency `4 R T` per polarization.
    pub fn efficiency(&self) -> SplitterEfficiency {
        let power = self.multibeam_power_coefficients();
        let es = 4.0 * power.rs * power.ts;
        let ep = 4.0 * power.rp * power.tp;
        SplitterEfficiency {
            es,
            ep,
            e_avg: effective_power(es, ep),
        }
    }
}
