use std::sync::Arc;

use buffer_sorter::{ComputeBackend, HostTransfer, SortError, SortOptions, Sorter, WgpuBackend, WgpuBackendConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn gpu_sorter() -> Option<Sorter<WgpuBackend>> {
    match pollster::block_on(WgpuBackend::request(WgpuBackendConfig::default())) {
        Ok(backend) => Some(Sorter::new(backend)),
        Err(error) => {
            eprintln!("skipping GPU test: {error}");
            None
        }
    }
}

fn sort_on_gpu(sorter: &mut Sorter<WgpuBackend>, data: &[i32], options: SortOptions) -> Vec<i32> {
    let values = sorter.backend_mut().upload("Test values", data).unwrap();
    sorter.sort(&values, options).unwrap();
    let result = sorter.backend_mut().download(&values).unwrap();
    sorter.backend_mut().release_buffer(values);
    result
}

fn expected(data: &[i32], options: SortOptions) -> Vec<i32> {
    let length = options.effective_length(data.len());
    let mut result = data.to_vec();
    result[..length].sort_unstable();
    if options.reverse {
        result[..length].reverse();
    }
    result
}

#[test]
fn sorts_small_buffer() {
    let Some(mut sorter) = gpu_sorter() else { return };
    let data = [5, -3, 5, 0, 9];

    assert_eq!(sort_on_gpu(&mut sorter, &data, SortOptions::ascending()), vec![-3, 0, 5, 5, 9]);
    assert_eq!(sort_on_gpu(&mut sorter, &data, SortOptions::descending()), vec![9, 5, 5, 0, -3]);
    assert_eq!(sort_on_gpu(&mut sorter, &data, SortOptions::ascending().first(3)), vec![-3, 5, 5, 0, 9]);
}

#[test]
fn matches_host_sort_on_random_buffers() {
    let Some(mut sorter) = gpu_sorter() else { return };
    let mut rng = StdRng::seed_from_u64(42);

    for count in [1, 2, 3, 255, 256, 257, 1000, 4096, 70_000] {
        for reverse in [false, true] {
            for length in [None, Some(20), Some(count / 2)] {
                let options = SortOptions { reverse, length };
                let data: Vec<i32> = (0..count).map(|_| rng.gen_range(-100..100)).collect();
                assert_eq!(sort_on_gpu(&mut sorter, &data, options), expected(&data, options), "count {count}, {options:?}");
            }
        }
    }
}

#[test]
fn spills_into_second_grid_dimension() {
    let Some(mut sorter) = gpu_sorter() else { return };
    let mut rng = StdRng::seed_from_u64(9);

    let count = buffer_sorter::network::MAX_DIM_THREADS as usize * 2 + 3;
    let data: Vec<i32> = (0..count).map(|_| rng.gen()).collect();
    let options = SortOptions::descending();
    assert_eq!(sort_on_gpu(&mut sorter, &data, options), expected(&data, options));
}

#[test]
fn sorts_values_by_keys() {
    let Some(mut sorter) = gpu_sorter() else { return };

    let backend = sorter.backend_mut();
    let values = backend.upload("Test values", &[10, 20, 30, 40, 50]).unwrap();
    let keys = backend.upload("Test keys", &[3, -1, 4, 0, 2]).unwrap();

    sorter.sort_by_keys(&values, &keys, SortOptions::ascending()).unwrap();
    assert_eq!(sorter.backend_mut().download(&values).unwrap(), vec![20, 40, 50, 10, 30]);
    assert_eq!(sorter.backend_mut().download(&keys).unwrap(), vec![3, -1, 4, 0, 2]);

    // the largest key is also the padding value
    let values = sorter.backend_mut().upload("Test values", &[1, 2, 3, 4, 5]).unwrap();
    let keys = sorter.backend_mut().upload("Test keys", &[7, 7, 0, 7, 7]).unwrap();
    sorter.sort_by_keys(&values, &keys, SortOptions::ascending()).unwrap();
    let mut result = sorter.backend_mut().download(&values).unwrap();
    assert_eq!(result[0], 3);
    result[1..].sort_unstable();
    assert_eq!(result, vec![3, 1, 2, 4, 5]);
}

fn request_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None)).ok()
}

#[test]
fn buffer_without_storage_usage_is_a_backend_error() {
    let Some((device, queue)) = request_device() else {
        eprintln!("skipping GPU test: no adapter");
        return;
    };
    let device = Arc::new(device);
    let backend = WgpuBackend::new(device.clone(), Arc::new(queue), &WgpuBackendConfig::default()).unwrap();
    let mut sorter = Sorter::new(backend);

    let values = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Copy only values"),
        size: 16,
        usage: wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let result = sorter.sort(&values, SortOptions::ascending());
    assert!(matches!(result, Err(SortError::Backend(_))), "{result:?}");

    // the backend is still usable afterwards
    let data = [3, 1, 2];
    let values = sorter.backend_mut().upload("Test values", &data).unwrap();
    sorter.sort(&values, SortOptions::ascending()).unwrap();
    assert_eq!(sorter.backend_mut().download(&values).unwrap(), vec![1, 2, 3]);
}

#[test]
fn rejects_invalid_input_before_touching_the_device() {
    let Some(mut sorter) = gpu_sorter() else { return };

    let values = sorter.backend_mut().upload("Test values", &[4, 3, 2, 1]).unwrap();
    let keys = sorter.backend_mut().upload("Test keys", &[1]).unwrap();
    let result = sorter.sort_by_keys(&values, &keys, SortOptions::ascending());
    assert!(matches!(result, Err(SortError::KeyBufferTooShort { keys: 1, required: 4 })));
    assert_eq!(sorter.backend_mut().download(&values).unwrap(), vec![4, 3, 2, 1]);

    sorter.sort(&values, SortOptions::ascending().first(0)).unwrap();
    assert_eq!(sorter.backend_mut().download(&values).unwrap(), vec![4, 3, 2, 1]);
}
