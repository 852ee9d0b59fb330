//! GLSL 3.30 shader sources used by the GPU back end.
//!
//! All programs render a full-viewport quad; fragment shaders sample
//! rectangle textures with pixel-based coordinates.

/// Vertex positions in clip space with per-vertex texture coordinates in
/// pixels.
pub const PASS_THROUGH_VERT: &str = r#"
#version 330 core

layout(location = 0) in vec2 Position;
layout(location = 1) in vec2 TexCoord;

out vec2 TexCoordOut;

void main()
{
    gl_Position = vec4(Position, 0.0, 1.0);
    TexCoordOut = TexCoord;
}
"#;

pub const COPY_FRAG: &str = r#"
#version 330 core

uniform sampler2DRect Image;

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    Color = texture(Image, TexCoordOut);
}
"#;

/// One half of the separable Gaussian; the kernel array holds the peak at
/// index 0. Edge pixels clamp to the texture border.
pub const GAUSSIAN_HORZ_FRAG: &str = r#"
#version 330 core

#define MAX_KERNEL_RADIUS 30

uniform sampler2DRect Image;
uniform int KernelRadius;
uniform float GaussianKernel[MAX_KERNEL_RADIUS];
uniform bool IsMono;

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    vec2 maxCoord = vec2(textureSize(Image)) - vec2(0.5, 0.5);

    vec3 acc = texture(Image, TexCoordOut).rgb * GaussianKernel[0];
    for (int i = 1; i < KernelRadius; i++)
    {
        vec2 right = vec2(min(TexCoordOut.x + float(i), maxCoord.x), TexCoordOut.y);
        vec2 left  = vec2(max(TexCoordOut.x - float(i), 0.5), TexCoordOut.y);
        acc += (texture(Image, right).rgb + texture(Image, left).rgb) * GaussianKernel[i];
    }

    if (IsMono)
        Color = vec4(acc.r, acc.r, acc.r, 1.0);
    else
        Color = vec4(acc, 1.0);
}
"#;

pub const GAUSSIAN_VERT_FRAG: &str = r#"
#version 330 core

#define MAX_KERNEL_RADIUS 30

uniform sampler2DRect Image;
uniform int KernelRadius;
uniform float GaussianKernel[MAX_KERNEL_RADIUS];

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    vec2 maxCoord = vec2(textureSize(Image)) - vec2(0.5, 0.5);

    vec3 acc = texture(Image, TexCoordOut).rgb * GaussianKernel[0];
    for (int i = 1; i < KernelRadius; i++)
    {
        vec2 up   = vec2(TexCoordOut.x, min(TexCoordOut.y + float(i), maxCoord.y));
        vec2 down = vec2(TexCoordOut.x, max(TexCoordOut.y - float(i), 0.5));
        acc += (texture(Image, up).rgb + texture(Image, down).rgb) * GaussianKernel[i];
    }

    Color = vec4(acc, 1.0);
}
"#;

pub const DIVIDE_FRAG: &str = r#"
#version 330 core

uniform sampler2DRect InputArray1;
uniform sampler2DRect InputArray2;
uniform bool IsMono;

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    // epsilon prevents division by zero and NaN propagation
    vec3 a = texture(InputArray1, TexCoordOut).rgb;
    vec3 b = texture(InputArray2, TexCoordOut).rgb;
    vec3 result = a / (b + vec3(1.0e-8));

    if (IsMono)
        Color = vec4(result.r, result.r, result.r, 1.0);
    else
        Color = vec4(result, 1.0);
}
"#;

pub const MULTIPLY_FRAG: &str = r#"
#version 330 core

uniform sampler2DRect InputArray1;
uniform sampler2DRect InputArray2;
uniform bool IsMono;

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    vec3 result = texture(InputArray1, TexCoordOut).rgb * texture(InputArray2, TexCoordOut).rgb;

    if (IsMono)
        Color = vec4(result.r, result.r, result.r, 1.0);
    else
        Color = vec4(result, 1.0);
}
"#;

/// Blends the image with its blur; for the adaptive variant the amount
/// follows the transition cubic of the blurred raw image's brightness.
pub const UNSHARP_MASK_FRAG: &str = r#"
#version 330 core

uniform sampler2DRect Image;
uniform sampler2DRect BlurredImage;
uniform sampler2DRect InputImageBlurred;
uniform ivec2 SelectionPos;
uniform bool IsMono;
uniform bool Adaptive;
uniform float AmountMin;
uniform float AmountMax;
uniform float Threshold;
uniform float Width;
// transition cubic coefficients: a, b, c, d
uniform vec4 TransitionCurve;

in vec2 TexCoordOut;
out vec4 Color;

void main()
{
    float amount;
    if (!Adaptive)
    {
        amount = AmountMax;
    }
    else
    {
        // steering brightness comes from the blurred full image, so the
        // coordinates are offset by the selection origin
        float l = texture(InputImageBlurred, TexCoordOut + vec2(SelectionPos)).r;
        if (l < Threshold - Width)
            amount = AmountMin;
        else if (l > Threshold + Width)
            amount = AmountMax;
        else
            amount = l * (l * (TransitionCurve.x * l + TransitionCurve.y) + TransitionCurve.z)
                + TransitionCurve.w;
    }

    vec3 result = amount * texture(Image, TexCoordOut).rgb
        + (1.0 - amount) * texture(BlurredImage, TexCoordOut).rgb;
    result = clamp(result, 0.0, 1.0);

    if (IsMono)
        Color = vec4(result.r, result.r, result.r, 1.0);
    else
        Color = vec4(result, 1.0);
}
"#;

/// Applies the tone curve: gamma mode, piecewise linear or the
/// precomputed spline segments, uploaded as uniforms.
pub const TONE_CURVE_FRAG: &str = r#"
#version 330 core

#define MAX_CURVE_POINTS 64

uniform sampler2DRect Image;
uniform bool IsMono;
uniform int NumPoints;
uniform vec2 CurvePoints[MAX_CURVE_POINTS];
uniform vec4 Splines[MAX_CURVE_POINTS - 1];
uniform bool Smooth;
uniform bool IsGamma;
uniform float Gamma;

in vec2 TexCoordOut;
out vec4 Color;

float curve_value(float x)
{
    if (IsGamma)
    {
        vec2 first = CurvePoints[0];
        vec2 last = CurvePoints[1];
        if (x <= first.x) return first.y;
        if (x >= last.x) return last.y;
        return first.y + pow((x - first.x) / (last.x - first.x), 1.0 / Gamma) * (last.y - first.y);
    }

    if (x <= CurvePoints[0].x) return CurvePoints[0].y;
    if (x >= CurvePoints[NumPoints - 1].x) return CurvePoints[NumPoints - 1].y;

    int nextIdx = NumPoints - 1;
    for (int i = 1; i < NumPoints; i++)
    {
        if (CurvePoints[i].x >= x) { nextIdx = i; break; }
    }

    float deltaX = CurvePoints[nextIdx].x - CurvePoints[nextIdx - 1].x;
    float t = (x - CurvePoints[nextIdx - 1].x) / deltaX;

    float result;
    if (!Smooth)
    {
        result = mix(CurvePoints[nextIdx - 1].y, CurvePoints[nextIdx].y, t);
    }
    else
    {
        vec4 sp = Splines[nextIdx - 1];
        result = t * (t * (t * sp.x + sp.y) + sp.z) + sp.w;
    }
    return clamp(result, 0.0, 1.0);
}

void main()
{
    vec3 value = texture(Image, TexCoordOut).rgb;

    if (IsMono)
    {
        float v = curve_value(value.r);
        Color = vec4(v, v, v, 1.0);
    }
    else
    {
        Color = vec4(curve_value(value.r), curve_value(value.g), curve_value(value.b), 1.0);
    }
}
"#;
