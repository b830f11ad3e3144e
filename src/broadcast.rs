//! NumPy-style broadcasting helpers over `ndarray` dynamic arrays.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::errors::BindingError;

/// Computes the common broadcast shape of several shapes.
///
/// Shapes are aligned on their trailing axes; along each axis the sizes must
/// match or be 1.
pub fn broadcast_shape(shapes: &[&[usize]]) -> Result<Vec<usize>, BindingError> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1usize; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (i, &dim) in shape.iter().enumerate() {
            let slot = &mut out[offset + i];
            if *slot == 1 {
                *slot = dim;
            } else if dim != 1 && dim != *slot {
                return Err(BindingError::ShapeMismatch(
                    shapes.iter().map(|s| s.to_vec()).collect(),
                ));
            }
        }
    }
    Ok(out)
}

/// Broadcasts each array to the common shape of the whole set.
pub fn broadcast_together<'a>(
    arrays: &[&'a ArrayD<f64>],
) -> Result<(Vec<usize>, Vec<ArrayViewD<'a, f64>>), BindingError> {
    let shapes: Vec<&[usize]> = arrays.iter().map(|a| a.shape()).collect();
    let shape = broadcast_shape(&shapes)?;
    let views = arrays
        .iter()
        .map(|a| {
            a.broadcast(shape.as_slice()).ok_or_else(|| {
                BindingError::ShapeMismatch(shapes.iter().map(|s| s.to_vec()).collect())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((shape, views))
}

/// Broadcasts the arrays together and stacks them along a new leading axis.
pub fn broadcast_stack(arrays: &[ArrayD<f64>]) -> Result<ArrayD<f64>, BindingError> {
    let refs: Vec<&ArrayD<f64>> = arrays.iter().collect();
    let (_, views) = broadcast_together(&refs)?;
    ndarray::stack(Axis(0), &views).map_err(|_| {
        BindingError::ShapeMismatch(arrays.iter().map(|a| a.shape().to_vec()).collect())
    })
}

/// Promotes a 0-dimensional array to one dimension; higher ranks pass
/// through untouched.
pub fn atleast_1d(a: ArrayD<f64>) -> ArrayD<f64> {
    if a.ndim() == 0 {
        a.insert_axis(Axis(0))
    } else {
        a
    }
}

/// A 0-dimensional array holding one scalar.
pub fn scalar(v: f64) -> ArrayD<f64> {
    ArrayD::from_elem(IxDyn(&[]), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn shapes_broadcast_like_numpy() {
        assert_eq!(broadcast_shape(&[&[3], &[]]).unwrap(), vec![3]);
        assert_eq!(broadcast_shape(&[&[2, 1], &[3]]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shape(&[&[], &[]]).unwrap(), Vec::<usize>::new());
        assert!(broadcast_shape(&[&[2], &[3]]).is_err());
    }

    #[test]
    fn stack_broadcasts_scalars_up() {
        let cols = vec![arr1(&[1.0, 2.0, 3.0]).into_dyn(), scalar(5.0)];
        let stacked = broadcast_stack(&cols).unwrap();
        assert_eq!(stacked.shape(), &[2, 3]);
        assert_eq!(stacked[[1, 2]], 5.0);
    }

    #[test]
    fn atleast_1d_promotes_scalars() {
        assert_eq!(atleast_1d(scalar(2.0)).shape(), &[1]);
        let a = arr1(&[1.0]).into_dyn();
        assert_eq!(atleast_1d(a.clone()), a);
    }
}
