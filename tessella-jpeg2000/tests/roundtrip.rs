//! End-to-end encode/decode scenarios.

use tessella_jpeg2000::{
    ColorSpace, DecodeSettings, EncodeSettings, Image, ProgressionOrder, Rect, TileCacheStrategy,
    decode, encode,
};

fn gray_image(width: u32, height: u32, f: impl Fn(u32, u32) -> i32) -> Image {
    let mut image = Image::new(
        Rect::from_ltrb(0, 0, width, height),
        ColorSpace::Gray,
        1,
        8,
        false,
    )
    .unwrap();

    for y in 0..height {
        for x in 0..width {
            image.components[0].data[(y * width + x) as usize] = f(x, y).clamp(0, 255);
        }
    }

    image
}

fn rgb_image(width: u32, height: u32) -> Image {
    let mut image = Image::new(
        Rect::from_ltrb(0, 0, width, height),
        ColorSpace::Srgb,
        3,
        8,
        false,
    )
    .unwrap();

    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            image.components[0].data[idx] = ((x * 255) / width.max(1)) as i32;
            image.components[1].data[idx] = ((y * 255) / height.max(1)) as i32;
            image.components[2].data[idx] = ((x + y) % 256) as i32;
        }
    }

    image
}

/// A flat 32x32 plane must survive a lossless 5-3 round trip exactly.
#[test]
fn constant_gray_round_trip() {
    let image = gray_image(32, 32, |_, _| 128);

    let settings = EncodeSettings {
        num_resolutions: 3,
        mct: false,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();
    let decoded = decode(&bytes, &DecodeSettings::default()).unwrap();

    assert_eq!(decoded.components.len(), 1);
    assert_eq!(decoded.components[0].rect, Rect::from_ltrb(0, 0, 32, 32));
    assert!(decoded.components[0].data.iter().all(|&v| v == 128));
}

/// A structured image with odd dimensions round-trips exactly.
#[test]
fn gradient_round_trip() {
    let image = gray_image(75, 53, |x, y| ((x * 5 + y * 11) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 4,
        mct: false,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();
    let decoded = decode(&bytes, &DecodeSettings::default()).unwrap();

    assert_eq!(decoded.components[0].data, image.components[0].data);
}

/// A 3x3 tile grid with the last-tile cache strategy reconstructs the
/// full composite exactly.
#[test]
fn multi_tile_round_trip_last_tile_cache() {
    let image = gray_image(384, 384, |x, y| ((x / 3 + y / 5) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 4,
        tile_size: Some((128, 128)),
        mct: false,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();

    let decoded = decode(
        &bytes,
        &DecodeSettings {
            cache_strategy: TileCacheStrategy::LastTile,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(decoded.components[0].data, image.components[0].data);
}

/// RPCL progression with the all-tiles strategy: the composite must
/// not depend on packet arrival order.
#[test]
fn rpcl_progression_round_trip() {
    let image = gray_image(200, 144, |x, y| ((x ^ y) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 3,
        tile_size: Some((96, 96)),
        progression_order: ProgressionOrder::ResolutionPositionComponentLayer,
        mct: false,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();

    let decoded = decode(
        &bytes,
        &DecodeSettings {
            cache_strategy: TileCacheStrategy::AllTiles,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(decoded.components[0].data, image.components[0].data);
}

/// Every built-in progression order decodes to the same samples.
#[test]
fn all_progression_orders_agree() {
    let image = gray_image(90, 66, |x, y| ((3 * x + 7 * y) % 256) as i32);

    for order in [
        ProgressionOrder::LayerResolutionComponentPosition,
        ProgressionOrder::ResolutionLayerComponentPosition,
        ProgressionOrder::ResolutionPositionComponentLayer,
        ProgressionOrder::PositionComponentResolutionLayer,
        ProgressionOrder::ComponentPositionResolutionLayer,
    ] {
        let settings = EncodeSettings {
            num_resolutions: 3,
            progression_order: order,
            mct: false,
            ..Default::default()
        };

        let bytes = encode(&image, &settings).unwrap();
        let decoded = decode(&bytes, &DecodeSettings::default()).unwrap();

        assert_eq!(
            decoded.components[0].data, image.components[0].data,
            "{order:?}"
        );
    }
}

/// Encoding the same image twice yields byte-identical output.
#[test]
fn encoding_is_deterministic() {
    let image = gray_image(64, 48, |x, y| ((x * y) % 256) as i32);
    let settings = EncodeSettings::default();

    let first = encode(&image, &settings).unwrap();
    let second = encode(&image, &settings).unwrap();

    assert_eq!(first, second);
}

/// Windowed decode produces the same samples inside the window as a
/// full decode cropped to it, and the output rectangle equals the
/// intersection of the window with the canvas.
#[test]
fn windowed_decode_matches_full() {
    let image = gray_image(128, 128, |x, y| ((x * 7 + y * 13) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 4,
        mct: false,
        ..Default::default()
    };
    let bytes = encode(&image, &settings).unwrap();

    let full = decode(&bytes, &DecodeSettings::default()).unwrap();

    let region = Rect::from_ltrb(37, 41, 91, 77);
    let windowed = decode(
        &bytes,
        &DecodeSettings {
            region: Some(region),
            ..Default::default()
        },
    )
    .unwrap();

    let component = &windowed.components[0];
    assert_eq!(component.rect, region);

    let full_width = full.components[0].rect.width();
    for y in region.y0..region.y1 {
        for x in region.x0..region.x1 {
            let expected = full.components[0].data[(y * full_width + x) as usize];
            let actual = component.data
                [((y - region.y0) * region.width() + (x - region.x0)) as usize];
            assert_eq!(actual, expected, "({x}, {y})");
        }
    }
}

/// A window larger than the canvas clips to it.
#[test]
fn oversized_window_clips_to_canvas() {
    let image = gray_image(64, 40, |x, y| ((x + 2 * y) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 3,
        mct: false,
        ..Default::default()
    };
    let bytes = encode(&image, &settings).unwrap();

    let windowed = decode(
        &bytes,
        &DecodeSettings {
            region: Some(Rect::from_ltrb(0, 0, 1000, 1000)),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(windowed.components[0].rect, Rect::from_ltrb(0, 0, 64, 40));
    assert_eq!(windowed.components[0].data, image.components[0].data);
}

/// Three components through the reversible multi-component transform.
#[test]
fn rgb_mct_round_trip() {
    let image = rgb_image(48, 36);

    let settings = EncodeSettings {
        num_resolutions: 3,
        mct: true,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();
    let decoded = decode(&bytes, &DecodeSettings::default()).unwrap();

    for (idx, component) in decoded.components.iter().enumerate() {
        assert_eq!(
            component.data, image.components[idx].data,
            "component {idx}"
        );
    }
}

/// The irreversible 9-7 path reconstructs within a small tolerance.
#[test]
fn lossy_97_round_trip_is_close() {
    let image = gray_image(64, 64, |x, y| ((x * 3 + y * 5) % 256) as i32);

    let settings = EncodeSettings {
        lossless: false,
        num_resolutions: 3,
        mct: false,
        ..Default::default()
    };

    let bytes = encode(&image, &settings).unwrap();
    let decoded = decode(&bytes, &DecodeSettings::default()).unwrap();

    let mut max_err = 0i64;
    for (a, b) in decoded.components[0]
        .data
        .iter()
        .zip(&image.components[0].data)
    {
        max_err = max_err.max((*a as i64 - *b as i64).abs());
    }

    assert!(max_err <= 8, "max error {max_err}");
}

/// Decoding through the host byte-source abstraction matches the
/// in-memory path.
#[test]
fn decode_through_source() {
    use tessella_jpeg2000::decode_source;
    use tessella_jpeg2000::stream::MemorySource;

    let image = gray_image(40, 40, |x, y| ((x * y) % 256) as i32);
    let settings = EncodeSettings {
        num_resolutions: 3,
        mct: false,
        ..Default::default()
    };
    let bytes = encode(&image, &settings).unwrap();

    let mut source = MemorySource::new(&bytes);
    let decoded = decode_source(&mut source, &DecodeSettings::default()).unwrap();

    assert_eq!(decoded.components[0].data, image.components[0].data);
}

/// Reduced-resolution decode yields the halved geometry.
#[test]
fn resolution_reduction_halves_output() {
    let image = gray_image(128, 96, |x, y| ((x + y) % 256) as i32);

    let settings = EncodeSettings {
        num_resolutions: 4,
        mct: false,
        ..Default::default()
    };
    let bytes = encode(&image, &settings).unwrap();

    let reduced = decode(
        &bytes,
        &DecodeSettings {
            resolution_reduction: 1,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(reduced.components[0].rect, Rect::from_ltrb(0, 0, 64, 48));
}
