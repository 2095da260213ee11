/// Storage for a model state: concentrations in species order.
///
/// Evaluators and steppers work on `&[f64]`; this trait is the bridge to the
/// container a caller already holds an initial state or reads a trajectory into.
/// Implemented for `Vec<f64>`, `[f64; N]`, nalgebra's `DVector` and, behind the
/// `ndarray` feature, `Array1`.
///
/// ```rust
/// use kinetic_codegen::prelude::Vector;
///
/// let blank: Vec<f64> = Vector::zeros(3);
/// assert_eq!(blank, vec![0.0; 3]);
///
/// let water = <[f64; 3] as Vector>::from_slice(&[55.4e3, 1e-4, 1e-4]);
/// assert_eq!(water.as_slice()[0], 55.4e3);
/// ```
pub trait Vector {
    fn as_slice(&self) -> &[f64];

    fn as_mut_slice(&mut self) -> &mut [f64];

    /// A zeroed state of `len` species.
    fn zeros(len: usize) -> Self;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `values` into a fresh vector.
    fn from_slice(values: &[f64]) -> Self
    where
        Self: Sized,
    {
        let mut out = Self::zeros(values.len());
        out.as_mut_slice().copy_from_slice(values);
        out
    }
}

impl Vector for Vec<f64> {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        vec![0.0; len]
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn from_slice(values: &[f64]) -> Self {
        values.to_vec()
    }
}

/// # Panics
/// `as_slice` and `as_mut_slice` panic if the array is not contiguous in
/// standard order, e.g. after `invert_axis`.
#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn as_slice(&self) -> &[f64] {
        ndarray::Array1::as_slice(self).expect("Array1 must be contiguous")
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self.as_slice_mut().expect("Array1 must be contiguous")
    }

    fn zeros(len: usize) -> Self {
        ndarray::Array1::zeros(len)
    }

    fn len(&self) -> usize {
        ndarray::Array1::len(self)
    }
}

impl Vector for nalgebra::DVector<f64> {
    fn as_slice(&self) -> &[f64] {
        nalgebra::DVector::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        nalgebra::DVector::as_mut_slice(self)
    }

    fn zeros(len: usize) -> Self {
        nalgebra::DVector::zeros(len)
    }

    fn len(&self) -> usize {
        nalgebra::DVector::len(self)
    }

    fn from_slice(values: &[f64]) -> Self {
        nalgebra::DVector::from_vec(values.to_vec())
    }
}

/// # Panics
/// `zeros` and `from_slice` panic unless the length is `N`.
impl<const N: usize> Vector for [f64; N] {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        assert_eq!(len, N, "state has {len} species, array holds {N}");
        [0.0; N]
    }

    fn len(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_roundtrip() {
        let v = Vec::<f64>::from_slice(&[1.0, 2.0]);
        assert_eq!(Vector::len(&v), 2);
        assert_eq!(Vector::as_slice(&v), &[1.0, 2.0]);
    }

    #[test]
    fn test_dvector() {
        let v = <nalgebra::DVector<f64> as Vector>::from_slice(&[3.0, 4.0, 5.0]);
        assert_eq!(Vector::as_slice(&v), &[3.0, 4.0, 5.0]);
        assert!(!Vector::is_empty(&v));
    }

    #[test]
    fn test_array() {
        let mut arr = <[f64; 3]>::zeros(3);
        Vector::as_mut_slice(&mut arr)[1] = 7.0;
        assert_eq!(arr, [0.0, 7.0, 0.0]);
    }

    #[test]
    #[should_panic]
    fn test_array_length_mismatch() {
        let _ = <[f64; 2] as Vector>::from_slice(&[1.0, 2.0, 3.0]);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray() {
        let v = <ndarray::Array1<f64> as Vector>::from_slice(&[1.0, 2.0]);
        assert_eq!(Vector::as_slice(&v), &[1.0, 2.0]);
    }
}
